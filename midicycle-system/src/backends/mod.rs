pub mod dummy;
#[cfg(feature = "jack")]
pub mod jack;
