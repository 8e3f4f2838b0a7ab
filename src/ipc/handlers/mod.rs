pub mod calc;
pub mod core;
pub mod grades;
pub mod policy;
