mod workload;

pub use workload::*;
