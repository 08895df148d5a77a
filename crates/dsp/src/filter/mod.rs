//! Overlap-save fast-convolution filter (spec.md §4.3): a single master
//! input side shared by any number of decimating output slaves.

mod kaiser;
mod master;
mod slave;

pub use kaiser::{design_response, kaiser_window, noise_gain};
pub use master::FilterMaster;
pub use slave::{FilterSlave, OutputType};
