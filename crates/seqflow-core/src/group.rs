//! Batch grouping for joint processing, and the mandatory ungroup step.
//!
//! Items whose records share a batch, region and program are combined into
//! one work item named after the batch. The combined record lists each
//! contributing sample and the path where that sample's share of the output
//! is expected. After the stage has run, `ungroup` turns every combined
//! result back into one record per original sample, either by linking the
//! combined output (single member) or by extracting the sample's subset.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use seqflow_types::record::{DataRecord, GroupMember, Region, WorkItem};

use crate::split::split_extension;
use crate::tools::{FormatTools, ToolError};

/// Grouping key: (batch, region, program).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchKey {
    pub batch: String,
    pub region: Option<Region>,
    pub program: Option<String>,
}

impl BatchKey {
    fn of(item: &WorkItem) -> Option<Self> {
        let batch = item.record.batch.clone()?;
        Some(Self {
            batch,
            region: item.region.clone().or_else(|| item.record.region.clone()),
            program: item.record.program.clone(),
        })
    }

    /// File stem for the combined output.
    fn stem(&self) -> String {
        let mut parts = vec![self.batch.clone()];
        if let Some(region) = &self.region {
            parts.push(region.chunk_key());
        }
        if let Some(program) = &self.program {
            parts.push(program.clone());
        }
        parts.join("-")
    }
}

/// An original record folded into a combined item, with the path its share
/// of the combined output is extracted to.
#[derive(Debug, Clone)]
pub struct Contributor {
    pub record: DataRecord,
    pub expected_output: PathBuf,
}

/// Grouped work items plus what ungrouping needs.
#[derive(Debug, Clone)]
pub struct BatchPlan {
    pub items: Vec<WorkItem>,
    /// Records folded into combined items. One sample may appear several
    /// times when it contributes to more than one region or program.
    pub originals: Vec<Contributor>,
    /// Number of combined items among `items`.
    pub combined: usize,
}

/// Folds batch members into combined work items.
pub struct BatchGrouper;

impl BatchGrouper {
    /// Group `items` by batch key. Items without a batch pass through.
    ///
    /// Contributing inputs are listed under indexed roles `<role>.0`,
    /// `<role>.1`, ... on the combined record, which takes its config from the
    /// first member.
    pub fn group(items: Vec<WorkItem>, input_role: &str) -> BatchPlan {
        let mut passthrough = Vec::new();
        let mut order: Vec<BatchKey> = Vec::new();
        let mut groups: HashMap<BatchKey, Vec<WorkItem>> = HashMap::new();

        for item in items {
            match BatchKey::of(&item) {
                Some(key) => {
                    if !groups.contains_key(&key) {
                        order.push(key.clone());
                    }
                    groups.entry(key).or_default().push(item);
                }
                None => passthrough.push(item),
            }
        }

        let mut out = passthrough;
        let mut originals = Vec::new();
        let combined = order.len();

        for key in order {
            let Some(members) = groups.remove(&key) else {
                continue;
            };
            let first = &members[0];
            let mut record = DataRecord::new(&key.batch);
            record.batch = Some(key.batch.clone());
            record.program = key.program.clone();
            record.region = key.region.clone();
            record.config = first.record.config.clone();

            let mut group = Vec::with_capacity(members.len());
            for (i, member) in members.iter().enumerate() {
                if let Some(path) = member.record.file(input_role) {
                    record.set_file(format!("{input_role}.{i}"), path);
                }
                group.push(GroupMember {
                    sample: member.record.name.clone(),
                    expected_output: member.target.clone().unwrap_or_default(),
                });
            }
            record.group = Some(group);

            let target = first
                .target
                .as_deref()
                .map(|t| combined_target(t, &key.stem()));
            tracing::debug!(
                batch = key.batch.as_str(),
                members = members.len(),
                "grouped batch"
            );

            out.push(WorkItem {
                stage: first.stage.clone(),
                record,
                region: key.region.clone(),
                target,
            });
            originals.extend(members.into_iter().map(|m| Contributor {
                expected_output: m.target.unwrap_or_default(),
                record: m.record,
            }));
        }

        BatchPlan {
            items: out,
            originals,
            combined,
        }
    }
}

fn combined_target(member_target: &Path, stem: &str) -> PathBuf {
    let (_, ext) = split_extension(member_target);
    let dir = member_target.parent().unwrap_or_else(|| Path::new("."));
    dir.join(format!("{stem}{ext}"))
}

/// Split combined results back into one record per original sample.
///
/// Results without a group pass through unchanged. Each combined result must
/// correspond to exactly one combined item; anything else is an error rather
/// than a silently short or padded result list.
pub async fn ungroup<T: FormatTools>(
    tools: &T,
    plan: &BatchPlan,
    output_role: &str,
    results: Vec<DataRecord>,
) -> Result<Vec<DataRecord>, GroupError> {
    let (combined, mut out): (Vec<DataRecord>, Vec<DataRecord>) =
        results.into_iter().partition(DataRecord::is_grouped);

    if combined.len() != plan.combined {
        return Err(GroupError::ResultCountMismatch {
            expected: plan.combined,
            actual: combined.len(),
        });
    }

    // One slot per contributor, matched on (sample, expected output).
    let mut slots: Vec<Option<DataRecord>> = vec![None; plan.originals.len()];
    for result in combined {
        let output = result
            .file(output_role)
            .ok_or_else(|| GroupError::MissingTarget {
                batch: result.name.clone(),
                role: output_role.to_string(),
            })?
            .to_path_buf();
        let members = result.group.as_deref().unwrap_or_default();
        let single = members.len() == 1;
        // A zero-length placeholder has no per-sample content to extract.
        let empty = tokio::fs::metadata(&output).await?.len() == 0;

        for member in members {
            if member.expected_output.as_os_str().is_empty() {
                return Err(GroupError::MissingTarget {
                    batch: result.name.clone(),
                    role: output_role.to_string(),
                });
            }
            if let Some(dir) = member.expected_output.parent() {
                tokio::fs::create_dir_all(dir).await?;
            }
            if empty {
                tools.write_placeholder(&member.expected_output).await?;
            } else if single {
                tools.link(&output, &member.expected_output).await?;
            } else {
                tools
                    .extract_sample(&output, &member.sample, &member.expected_output)
                    .await?;
            }

            let Some(index) = plan.originals.iter().position(|o| {
                o.record.name == member.sample && o.expected_output == member.expected_output
            }) else {
                return Err(GroupError::UnknownMember(member.sample.clone()));
            };
            if slots[index].is_some() {
                return Err(GroupError::DuplicateMember {
                    sample: member.sample.clone(),
                    output: member.expected_output.clone(),
                });
            }
            let mut record = plan.originals[index].record.clone();
            record.set_file(output_role, &member.expected_output);
            slots[index] = Some(record);
        }
        tracing::debug!(batch = result.name.as_str(), members = members.len(), "ungrouped batch");
    }

    for (slot, original) in slots.into_iter().zip(&plan.originals) {
        match slot {
            Some(record) => out.push(record),
            None => return Err(GroupError::UnknownMember(original.record.name.clone())),
        }
    }
    Ok(out)
}

/// Errors from grouping and ungrouping.
#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error("expected {expected} combined result(s), stage returned {actual}")]
    ResultCountMismatch { expected: usize, actual: usize },

    #[error("combined result '{batch}' has no '{role}' output to ungroup")]
    MissingTarget { batch: String, role: String },

    #[error("sample '{0}' is not a member of any combined result")]
    UnknownMember(String),

    #[error("sample '{sample}' has more than one result for {}", output.display())]
    DuplicateMember { sample: String, output: PathBuf },

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
