#[macro_use]
extern crate error_chain;

pub mod batch;
pub mod config;
pub mod control;
pub mod events;
pub mod history;
pub mod manager;
pub mod materialize;
pub mod ordinal;
pub mod retry;
pub mod selector;
pub mod status;
pub mod store;
pub mod unit;
pub mod unit_control;
pub mod unitset;

#[cfg(test)]
mod testing;

/// API group shared by both custom resources.
pub const API_GROUP: &str = "pikach.us";

/// Label carrying the name of the revision a Unit was built from.
pub const REVISION_LABEL: &str = "controller-revision-hash";

/// Label carrying a Unit's own name, part of its stable identity.
pub const UNIT_NAME_LABEL: &str = "unitset.pikach.us/unit-name";

pub mod errors {
    // Create the Error, ErrorKind, ResultExt, and Result types
    error_chain! {
        foreign_links {
            Io(std::io::Error);
            Kube(kube::Error);
            Json(serde_json::Error);
            Yaml(serde_yaml::Error);
        }

        errors {
            NotFound(kind: String, name: String) {
                description("object not found")
                display("{} {} not found", kind, name)
            }
            AlreadyExists(kind: String, name: String) {
                description("object already exists")
                display("{} {} already exists", kind, name)
            }
            Conflict(kind: String, name: String) {
                description("object was modified concurrently")
                display("conflict writing {} {}", kind, name)
            }
            RetriesExhausted(kind: String, name: String, attempts: u32) {
                description("conflict retries exhausted")
                display("gave up writing {} {} after {} conflicting attempts", kind, name, attempts)
            }
            InvalidSelector(reason: String) {
                description("invalid label selector")
                display("invalid label selector: {}", reason)
            }
            InvalidSpec(name: String, reason: String) {
                description("invalid UnitSet spec")
                display("UnitSet {} is invalid: {}", name, reason)
            }
            InvalidRevision(name: String, reason: String) {
                description("unreadable revision payload")
                display("revision {} cannot be applied: {}", name, reason)
            }
            ClaimTerminating(name: String) {
                description("claim is being deleted")
                display("PersistentVolumeClaim {} is being deleted", name)
            }
            Aggregate(errors: Vec<String>) {
                description("multiple errors")
                display(
                    "{}",
                    if errors.len() == 1 {
                        errors[0].clone()
                    } else {
                        format!("[{}]", errors.join(", "))
                    }
                )
            }
        }
    }

    impl Error {
        pub fn is_not_found(&self) -> bool {
            matches!(self.kind(), ErrorKind::NotFound(..))
        }

        pub fn is_conflict(&self) -> bool {
            matches!(self.kind(), ErrorKind::Conflict(..))
        }

        pub fn is_already_exists(&self) -> bool {
            matches!(self.kind(), ErrorKind::AlreadyExists(..))
        }

        /// Errors that retrying the same key cannot fix.
        pub fn is_permanent(&self) -> bool {
            matches!(
                self.kind(),
                ErrorKind::InvalidSelector(..)
                    | ErrorKind::InvalidSpec(..)
                    | ErrorKind::InvalidRevision(..)
            )
        }
    }

    /// Folds a list of errors into one. An empty list is success and a single
    /// error is returned as is.
    pub fn aggregate(mut errs: Vec<Error>) -> Result<()> {
        match errs.len() {
            0 => Ok(()),
            1 => Err(errs.remove(0)),
            _ => Err(ErrorKind::Aggregate(errs.iter().map(|e| e.to_string()).collect()).into()),
        }
    }
}

/*
A UnitSet owns Units named <set>-<ordinal>. The controller keeps the
ordinals [start, start+replicas) populated, condemns everything above, and
rolls Units from the current revision to the update revision:

- OrderedReady: one Unit moves at a time, each waits for its predecessors
  to be Running, Ready and Available.
- Parallel: creations and scale-down deletions run in slow-start batches.

Revisions are ControllerRevisions holding a replace patch of
spec.template, deduplicated by payload.
*/
