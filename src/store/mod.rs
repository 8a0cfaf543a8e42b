pub mod users;

pub use users::UserStore;
