pub(crate) mod digitiser;
pub(crate) mod noise;
pub(crate) mod pulses;
pub(crate) mod utils;
