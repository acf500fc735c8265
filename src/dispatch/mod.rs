pub mod queue;
pub mod refiner;

pub use queue::{RequestQueue, StreamingResponse};
pub use refiner::{build_refinement_prompt, refine_prompt};
