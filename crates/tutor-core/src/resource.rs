//! The closed set of entities the store holds

use serde::{Deserialize, Serialize};

use crate::assignment::Assignment;
use crate::episode::{Episode, EpisodeChunk, RejectedChunk};
use crate::evaluation::{OfflineEvaluation, OnlineEvaluation};
use crate::key::ResourceKind;
use crate::model::Model;
use crate::project::{Brain, Project};
use crate::session::Session;
use crate::snapshot::Snapshot;
use crate::TutorError;

/// Entity type that can be stored under a key of its kind
pub trait Entity:
    Clone + Into<Resource> + TryFrom<Resource, Error = TutorError> + Send + Sync + 'static
{
    /// Kind of the key segment the entity lives under
    const KIND: ResourceKind;
}

macro_rules! resources {
    ($($variant:ident($ty:ty)),* $(,)?) => {
        /// Any stored entity
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        #[serde(tag = "kind", content = "data", rename_all = "snake_case")]
        pub enum Resource {
            $(
                #[allow(missing_docs)]
                $variant($ty),
            )*
        }

        impl Resource {
            /// Kind of the wrapped entity
            #[must_use]
            pub fn kind(&self) -> ResourceKind {
                match self {
                    $(Self::$variant(_) => ResourceKind::$variant,)*
                }
            }
        }

        $(
            impl From<$ty> for Resource {
                fn from(entity: $ty) -> Self {
                    Self::$variant(entity)
                }
            }

            impl TryFrom<Resource> for $ty {
                type Error = TutorError;

                fn try_from(resource: Resource) -> Result<Self, TutorError> {
                    match resource {
                        Resource::$variant(entity) => Ok(entity),
                        other => Err(TutorError::InvalidState(format!(
                            "expected {}, found {}",
                            ResourceKind::$variant,
                            other.kind()
                        ))),
                    }
                }
            }

            impl Entity for $ty {
                const KIND: ResourceKind = ResourceKind::$variant;
            }
        )*
    };
}

resources! {
    Project(Project),
    Brain(Brain),
    Session(Session),
    Episode(Episode),
    Chunk(EpisodeChunk),
    RejectedChunk(RejectedChunk),
    Assignment(Assignment),
    Model(Model),
    Snapshot(Snapshot),
    OfflineEvaluation(OfflineEvaluation),
    OnlineEvaluation(OnlineEvaluation),
}
