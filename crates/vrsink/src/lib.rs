//! Stereoscopic and multiview video sink drawing through a GPU execution thread.
//!
//! Frames arrive on the producer thread, are optionally converted between
//! multiview layouts, and are handed to a dedicated GPU thread for display:
//!
//! ```text
//!   producer ── set_caps / prepare ──▶ ViewConverter ──▶ upload + fence
//!                                                            │ DisplaySlot
//!                                                            ▼
//!   show_frame ──▶ Window::draw ──▶ [GPU thread] on_draw ◀── exchange (next)
//!                                        │ promote next → stored
//!                                        └─▶ client draw / QuadRenderer ─▶ present
//! ```
//!
//! The GPU device is reached only through closures posted to its thread
//! (`gpu`). Window geometry, the aspect-ratio resizer and the exchange of
//! frames between threads live in their own modules; `sink` ties them
//! together behind a small state machine.

mod convert;
mod display;
mod exchange;
mod frame;
mod geometry;
pub mod gpu;
mod redisplay;
mod sink;
mod types;
mod window;

pub use convert::{
    eye_index, needs_conversion, output_info_for, Accepted, ConvertError, ConvertJob, ConvertedViews,
    ViewConverter,
};
pub use display::{GpuContext, GpuDisplay};
pub use exchange::{DisplaySlot, ExchangeSlots, FrameExchange, Promotion};
pub use frame::{FrameError, FrameFlags, FrameMeta, FramePool, VideoFrame, ViewRole};
pub use geometry::{center_rect, display_ratio, Rect, Resizer, WindowGeometry};
pub use sink::{
    AllocationProposal, ClientDrawHandler, ClientReshapeHandler, ErrorKind, FrameConsumer,
    GeometryProvider, NavigationEvent, NavigationHandler, Sample, Sink, SinkError, State,
    StateChange, StateMachine,
};
pub use types::{
    DisplayInfo, DownmixMode, Fraction, MultiviewFlags, MultiviewMode, PixelFormat, SinkSettings,
};
pub use window::{
    CloseCallback, DrawCallback, KeyAction, KeyCallback, MouseAction, MouseCallback,
    ResizeCallback, Window, WindowEvent,
};
