#[cfg(test)]
mod block_tests;
#[cfg(test)]
pub(crate) mod common;
#[cfg(test)]
mod stack_tests;
