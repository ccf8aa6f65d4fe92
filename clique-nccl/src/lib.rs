pub mod error;
pub mod factory;
pub mod group;
pub mod id;

pub use error::{NcclCliqueError, Result};
pub use factory::NcclCommunicatorFactory;
pub use group::NcclGroup;
pub use id::{NcclIdGenerator, clique_id_from_nccl, nccl_id_from_clique};
