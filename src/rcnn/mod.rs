pub mod bbox;
pub mod heads;
pub mod meta;
pub mod result;

#[cfg(test)]
pub(crate) mod testing;
