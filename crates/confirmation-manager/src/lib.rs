pub mod bridge;
pub mod dialog;
pub mod manager;
pub mod telegram;
pub mod types;

pub use bridge::SyncConfirmationBridge;
pub use dialog::DialogChannel;
pub use manager::ConfirmationManager;
pub use telegram::{spawn_update_listener, TelegramChannel};
pub use types::{
    default_action, order_failure_options, validation_options, zero_lots_options,
    ConfirmationAction, ConfirmationOption, ConfirmationResult, ConfirmationType, ResponseSource,
};
