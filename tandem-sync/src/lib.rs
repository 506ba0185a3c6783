pub mod context;
pub mod subsystems;

pub use context::AppContext;
pub use subsystems::migrate::{MigrationOrchestrator, MigrationReport};
pub use subsystems::writer::BatchedDocumentWriter;
