pub mod blockstore;
pub mod identity;
pub mod provenance;
pub mod worldstate;

pub use blockstore::{BlockStore, BlockStoreConfig, BlockStoreError};
pub use identity::IdentityQuerier;
pub use provenance::{KeyWithVersion, ProvenanceError, ProvenanceStore, TxDataForProvenance};
pub use worldstate::{DbUpdates, StateStore, StateStoreConfig, WorldStateError};
