//! Front end for hotel system notifications: tolerant request scanning, hot-reloaded
//! operation code routing, the handler chain and the TCP server.

pub mod dispatch;
pub mod handlers;
pub mod parse;
pub mod response;
pub mod routes;
pub mod server;

pub use dispatch::Dispatcher;
pub use handlers::{GuestUpsert, Handler, HandlerContext, HandlerRegistry, KeepAlive, ResChange, RoomChangeHandler, room_changes};
pub use parse::{Request, RequestBody, RequestHead, RequestShape, RoomNotice};
pub use response::{Ack, ReturnCode};
pub use routes::{ReloadableRoutes, Route, RouteSlot, RouteTable};
pub use server::{DEFAULT_MAX_FRAME, EOT, ProtocolServer};
