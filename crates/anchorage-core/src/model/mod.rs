pub mod binding;
pub mod descriptor;
pub mod distance;

pub use binding::CollectionBinding;
pub use descriptor::{ModelDescriptor, Provider};
pub use distance::Distance;
