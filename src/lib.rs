// Strand - a connection lifecycle engine
//
// Drives accepted connections through request handling, keepalive waits,
// suspended (comet) requests and duplex mode, with every deadline served by
// one shared timer scheduler.

// Re-export core functionality
pub use strand_core::*;
