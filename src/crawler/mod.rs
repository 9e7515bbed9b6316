pub mod controller;
pub mod parser;
pub mod scheduler;
pub mod task;

// Re-export common types
pub use controller::{ScrapeWorker, WorkerParts};
pub use parser::{ListingParser, SelectorListingParser};
pub use scheduler::{QueueStatus, ScrapeTaskQueue};
pub use task::{Listing, LookupResult, Priority, ScrapeTask};
