pub mod fleet;
pub mod options;
pub mod run;
pub mod tasks;
