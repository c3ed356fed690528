//! End-to-end checks that drive cpu-core the way an embedder would: install a
//! flat protected-mode layout, raise events, and inspect the stack frames and
//! register state left behind.

#[cfg(test)]
mod fixtures;
#[cfg(test)]
mod delivery;
#[cfg(test)]
mod smoke;
