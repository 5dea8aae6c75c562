pub mod ingest;
pub mod normalize;
pub mod stations;
pub mod summary;

pub use ingest::{IngestReport, MasterTableBuilder};
pub use normalize::{TripNormalizer, normalize};
pub use stations::{StationReference, build_station_dimension};
pub use summary::{SummaryBuilder, SummaryReport, SummaryTable};
