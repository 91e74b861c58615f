//! Peer boundary: the connection layer owns peers; the fetcher only reads the
//! available set, claims one peer per job, and reports misbehaviour.

pub mod pool;
pub mod reputation;
