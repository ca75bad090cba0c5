//! Retouch Core
//!
//! Chat-side image edit pipeline: message content model, image lookup,
//! result files and the per-user task orchestrator

pub mod content;
pub mod materializer;
pub mod media;
pub mod onebot;
pub mod platform;
pub mod resolver;
pub mod service;

pub use content::{ImageSegment, IncomingMessage, ReplySegment, Segment};
pub use materializer::Materializer;
pub use onebot::OneBotHttpApi;
pub use platform::{FileRelay, MessageQuery, OutgoingImage, ReplySink};
pub use resolver::{ImageResolver, ResolveError};
pub use service::{
    cap_deliverables, EditFailure, EditRequest, EditResult, EditService, Submission,
};
