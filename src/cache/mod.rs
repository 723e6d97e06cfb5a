//! Cache tables and the typed reads/writes the resolver, the handlers and the sync pass
//! perform on them.

pub mod clients;
pub mod reservations;
pub mod schema;

pub use clients::{
    ClientIdentity, client_record, clients_by_ext_refs, load_client, load_ext_refs, replace_ext_refs, select_clients,
};
pub use reservations::{
    DirtyReservation, DirtyRoom, ResKey, RoomAction, RoomChange, advance_res_watermark, advance_room_watermark,
    apply_room_change, load_reservation, occupant_record, oldest_dirty_reservation, oldest_dirty_room,
    reservation_record, room_record, save_reservation, set_rooming, touch_reservation,
};
pub use schema::{cache_schema, memory_store};
