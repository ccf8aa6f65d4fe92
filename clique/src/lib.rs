pub mod bootstrap;
pub mod callback;
pub mod collectives;
pub mod config;
pub mod error;
mod hash;
pub mod id;
pub mod rendezvous;
pub mod resolver;
pub mod types;

pub use bootstrap::{BootstrapPhase, CliqueBootstrap};
pub use callback::CliqueIdCallback;
pub use collectives::{
    Collectives, Communicator, CommunicatorFactory, GroupHandle, GroupRequest,
    LoopbackCommunicator, LoopbackFactory,
};
pub use config::CollectivesConfig;
pub use error::{CliqueError, Result};
pub use id::{CLIQUE_ID_SIZE, CliqueId, CliqueIdGenerator, RandomIdGenerator, create_unique_clique_id};
pub use rendezvous::{InMemoryRendezvous, KeyValueStore, KvStoreCallback, MemoryKvStore};
pub use resolver::{
    CollectivesBackend, ConfigResolver, global_resolver, install_global_resolver,
    teardown_global_resolver,
};
pub use types::{CliqueKey, ConfigMode, DeviceId, ORIGINATOR_RANK, Rank};
