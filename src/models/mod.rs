mod calendar_event;
mod contact_method;
mod external_contact;
mod identity;
mod person;
mod sync_state;

pub use calendar_event::*;
pub use contact_method::*;
pub use external_contact::*;
pub use identity::*;
pub use person::*;
pub use sync_state::*;
