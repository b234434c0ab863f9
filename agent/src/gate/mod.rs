pub mod change;
pub mod schedule;
