pub mod listener;

pub use listener::{Action, ActionHandler, ActionListener, ActionSender, ListenerState};
