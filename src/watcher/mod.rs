pub mod balance;
pub mod view;

pub use balance::BalanceWatcher;
