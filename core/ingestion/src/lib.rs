pub mod export;
pub mod pipeline;

pub use export::{ExportDocument, ExportError, ExportTurn};
pub use pipeline::{IngestionPipeline, PipelineConfig};
