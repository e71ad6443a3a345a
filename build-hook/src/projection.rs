//! Projection of a build event into key/value writes.
//!
//! Every tag of an event becomes one write group under
//! `containers/{docker_url}/{tag}` with the sub-keys `image`, `build`, `trigger`
//! and `details`, written in that order. Writes are sequential and
//! unconditional. The first failure aborts the projection and nothing that was
//! already written is rolled back, so a failed projection can leave a partially
//! written group behind. Two concurrent events for the same image and tag race
//! per sub-key; the last write to land on each key wins.
use crate::event::BuildEvent;
use crate::metrics_defs::{STORE_WRITE_FAILURES, STORE_WRITES};
use crate::store::{KvStore, StoreError};
use shared::counter;

pub const KEY_ROOT: &str = "containers";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubKey {
    Image,
    Build,
    Trigger,
    Details,
}

impl SubKey {
    /// Write order within a group.
    pub const ALL: [SubKey; 4] = [SubKey::Image, SubKey::Build, SubKey::Trigger, SubKey::Details];

    pub const fn as_str(&self) -> &'static str {
        match self {
            SubKey::Image => "image",
            SubKey::Build => "build",
            SubKey::Trigger => "trigger",
            SubKey::Details => "details",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Write {
    pub key: String,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WriteGroup {
    pub tag: String,
    pub prefix: String,
    pub writes: Vec<Write>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProjectionReport {
    pub groups: usize,
    pub writes: usize,
}

#[derive(thiserror::Error, Debug)]
pub enum ProjectionError {
    #[error("cannot build key prefix: {0}")]
    InvalidPrefix(&'static str),

    #[error("could not serialize build event: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("write to {key} failed after {completed} successful writes: {source}")]
    Write {
        tag: String,
        key: String,
        completed: usize,
        source: StoreError,
    },
}

pub fn key_prefix(docker_url: &str, tag: &str) -> String {
    format!("{KEY_ROOT}/{docker_url}/{tag}")
}

fn is_dot_segment(segment: &str) -> bool {
    segment == "." || segment == ".."
}

/// Builds the ordered write plan for `event` without touching the store.
///
/// Events without tags produce an empty plan. Otherwise `docker_url` and every
/// tag must be non-empty, and neither may contain a `.` or `..` path segment,
/// which would move the keys outside the fixed layout. An invalid event is
/// rejected as a whole so that no write is issued for it.
pub fn plan_writes(event: &BuildEvent) -> Result<Vec<WriteGroup>, ProjectionError> {
    if event.docker_tags.is_empty() {
        return Ok(Vec::new());
    }
    if event.docker_url.is_empty() {
        return Err(ProjectionError::InvalidPrefix("docker_url is empty"));
    }
    if event.docker_tags.iter().any(|tag| tag.is_empty()) {
        return Err(ProjectionError::InvalidPrefix("event contains an empty tag"));
    }
    if event.docker_url.split('/').any(is_dot_segment) {
        return Err(ProjectionError::InvalidPrefix("docker_url contains a relative path segment"));
    }
    if event.docker_tags.iter().any(|tag| is_dot_segment(tag)) {
        return Err(ProjectionError::InvalidPrefix("event contains a relative path tag"));
    }

    let details = serde_json::to_string(event)?;

    let groups = event
        .docker_tags
        .iter()
        .map(|tag| {
            let prefix = key_prefix(&event.docker_url, tag);
            let writes = SubKey::ALL
                .iter()
                .map(|sub_key| {
                    let value = match sub_key {
                        SubKey::Image => &event.image_id,
                        SubKey::Build => &event.build_id,
                        SubKey::Trigger => &event.trigger_id,
                        SubKey::Details => &details,
                    };
                    Write {
                        key: format!("{prefix}/{}", sub_key.as_str()),
                        value: value.clone(),
                    }
                })
                .collect();

            WriteGroup {
                tag: tag.clone(),
                prefix,
                writes,
            }
        })
        .collect();

    Ok(groups)
}

/// Writes every group of `event` to `store`, stopping at the first failure.
pub async fn project(
    store: &dyn KvStore,
    event: &BuildEvent,
) -> Result<ProjectionReport, ProjectionError> {
    let groups = plan_writes(event)?;
    let mut completed = 0;

    for group in &groups {
        for write in &group.writes {
            if let Err(source) = store.set(&write.key, &write.value).await {
                counter!(STORE_WRITE_FAILURES).increment(1);
                return Err(ProjectionError::Write {
                    tag: group.tag.clone(),
                    key: write.key.clone(),
                    completed,
                    source,
                });
            }
            counter!(STORE_WRITES).increment(1);
            completed += 1;
        }
        tracing::debug!(prefix = %group.prefix, store = store.name(), "Wrote group");
    }

    Ok(ProjectionReport {
        groups: groups.len(),
        writes: completed,
    })
}
