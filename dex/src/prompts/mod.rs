//! Hat prompt resolution

mod embedded;
mod loader;

pub use embedded::get_embedded;
pub use loader::{PromptContext, PromptLoader};
