//! Avatar stage: session, presentation and microphone gating for a streaming
//! video avatar.
//!
//! The stage sits between a third-party avatar transport and a host UI with a
//! handful of video surfaces:
//! Transport events → Session → Ending chain / Presentation → Surfaces + Mic
//!
//! # Architecture
//!
//! Everything runs on one [`StageDirector`] task that serialises its inputs
//! through a single `tokio::select!`:
//! - **Session** ([`session`]): INACTIVE → CONNECTING → CONNECTED lifecycle
//!   over the transport, and the single authoritative mute flag
//! - **Volume gate** ([`volume`]): samples the avatar's audio and mutes the
//!   microphone while it is audibly talking
//! - **Ending chain** ([`ending`]): debounce then countdown after the avatar
//!   falls silent, ending the session
//! - **Presentation** ([`presentation`]): keeps exactly one video surface
//!   active and heals drift
//! - **Services** ([`services`]): token fetch and the remote session sweep

pub mod config;
pub mod diagnostics;
pub mod director;
pub mod ending;
pub mod error;
pub mod presentation;
pub mod runtime;
pub mod services;
pub mod session;
pub mod speech;
pub mod stream;
pub mod timer;
pub mod volume;

#[doc(hidden)]
pub mod test_utils;

pub use config::StageConfig;
pub use director::{StageCommand, StageDirector, StageHandle, StageParts};
pub use error::{Result, StageError};
pub use presentation::{PresentationEvent, PresentationState, SurfaceId};
pub use runtime::{AppSignal, StageEvent};
pub use session::SessionState;
