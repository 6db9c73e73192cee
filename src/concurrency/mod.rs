//! Thread pool used for accept loops, blocking connections and the health endpoint

mod executor;

pub use executor::{Executor, State, Task};
