//! API routes and handlers

mod internal;
mod router;
mod vlm;

pub use router::create_router;
