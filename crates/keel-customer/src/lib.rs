pub mod cached;
pub mod error;
pub mod inmemory;
pub mod requirements;
pub mod store;
pub mod types;

pub use cached::CachedCustomerDataStore;
pub use error::CustomerDataError;
pub use inmemory::InMemoryCustomerDataStore;
pub use requirements::missing_fields;
pub use store::CustomerDataStore;
pub use types::{
    ChannelIdentity, CustomerProfile, EntrySource, ItemStatus, ProfileAsset, VariableEntry,
};
