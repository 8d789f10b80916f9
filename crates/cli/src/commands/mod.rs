pub mod analyze;
pub mod list;
pub mod render;
pub mod report;

pub use analyze::*;
pub use list::*;
pub use render::*;
pub use report::*;
