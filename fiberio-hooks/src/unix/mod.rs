pub mod sleep;

pub mod socket;

pub mod read;

pub mod write;
