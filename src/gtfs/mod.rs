pub mod calendar;
pub mod convert;
pub mod tables;
pub mod textutil;
