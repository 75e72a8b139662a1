pub mod dirutils;
pub mod logger;
pub mod startup;
