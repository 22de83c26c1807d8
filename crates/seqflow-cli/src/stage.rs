//! Command-template stages declared in the run description.
//!
//! A template is parsed once when the stage is built, so unknown
//! placeholders fail at startup rather than halfway through a run.
//!
//! | Placeholder       | Expands to                                          |
//! |-------------------|-----------------------------------------------------|
//! | `{sample}`        | record name                                         |
//! | `{input}`         | file under the stage's input role                   |
//! | `{input:ROLE}`    | file under `ROLE`                                   |
//! | `{inputs:ROLE}`   | every file under `ROLE` or `ROLE.<n>` (batches)     |
//! | `{output}`        | transactional temp path for the stage output        |
//! | `{region}`        | item region, empty when unsplit                     |
//! | `{cores}`         | cores per worker                                    |
//! | `{memory}`        | memory per worker in megabytes, empty when unknown  |
//! | `{jvm_opts}`      | JVM options for the stage's programs                |
//!
//! `{{` and `}}` produce literal braces.

use std::path::{Path, PathBuf};

use seqflow_core::resources::Allocation;
use seqflow_core::stage::{OutputSpec, Stage, StageFuture};
use seqflow_infra::process::run_shell;
use seqflow_infra::tools::write_placeholder;
use seqflow_infra::transaction::with_transaction;
use seqflow_types::config::{SplitStrategy, StageDefinition};
use seqflow_types::error::StageError;
use seqflow_types::record::{DataRecord, WorkItem};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Sample,
    Input(Option<String>),
    Inputs(String),
    Output,
    Region,
    Cores,
    Memory,
    JvmOpts,
}

/// Errors from parsing a command template.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("stage '{stage}': unknown placeholder '{{{placeholder}}}'")]
    UnknownPlaceholder { stage: String, placeholder: String },

    #[error("stage '{stage}': unclosed '{{' in command template")]
    Unclosed { stage: String },
}

/// A parsed shell command template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    segments: Vec<Segment>,
}

impl CommandTemplate {
    pub fn parse(stage: &str, template: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut text = String::new();
        let mut chars = template.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    text.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    text.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) => name.push(c),
                            None => {
                                return Err(TemplateError::Unclosed {
                                    stage: stage.to_string(),
                                });
                            }
                        }
                    }
                    if !text.is_empty() {
                        segments.push(Segment::Text(std::mem::take(&mut text)));
                    }
                    segments.push(placeholder(stage, &name)?);
                }
                c => text.push(c),
            }
        }
        if !text.is_empty() {
            segments.push(Segment::Text(text));
        }
        Ok(Self { segments })
    }

    /// Render for one item, writing output to `output`.
    fn render(
        &self,
        item: &WorkItem,
        input_role: &str,
        alloc: &Allocation,
        output: &Path,
    ) -> Result<String, StageError> {
        let record = &item.record;
        let mut line = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => line.push_str(text),
                Segment::Sample => line.push_str(&shell_quote(&record.name)),
                Segment::Input(role) => {
                    let role = role.as_deref().unwrap_or(input_role);
                    line.push_str(&shell_quote_path(required_file(record, role)?));
                }
                Segment::Inputs(role) => {
                    let files = role_files(record, role);
                    if files.is_empty() {
                        return Err(missing_role(record, role));
                    }
                    let quoted: Vec<String> = files.into_iter().map(shell_quote_path).collect();
                    line.push_str(&quoted.join(" "));
                }
                Segment::Output => line.push_str(&shell_quote_path(output)),
                Segment::Region => {
                    if let Some(region) = &item.region {
                        line.push_str(&shell_quote(&region.to_string()));
                    }
                }
                Segment::Cores => line.push_str(&alloc.cores_per_worker.to_string()),
                Segment::Memory => {
                    if let Some(memory) = alloc.memory_per_worker {
                        line.push_str(&memory.as_mb().to_string());
                    }
                }
                Segment::JvmOpts => line.push_str(&alloc.jvm_opts.join(" ")),
            }
        }
        Ok(line)
    }
}

fn placeholder(stage: &str, name: &str) -> Result<Segment, TemplateError> {
    let segment = match name.split_once(':') {
        None => match name {
            "sample" => Segment::Sample,
            "input" => Segment::Input(None),
            "output" => Segment::Output,
            "region" => Segment::Region,
            "cores" => Segment::Cores,
            "memory" => Segment::Memory,
            "jvm_opts" => Segment::JvmOpts,
            _ => return Err(unknown(stage, name)),
        },
        Some(("input", role)) if !role.is_empty() => Segment::Input(Some(role.to_string())),
        Some(("inputs", role)) if !role.is_empty() => Segment::Inputs(role.to_string()),
        Some(_) => return Err(unknown(stage, name)),
    };
    Ok(segment)
}

fn unknown(stage: &str, name: &str) -> TemplateError {
    TemplateError::UnknownPlaceholder {
        stage: stage.to_string(),
        placeholder: name.to_string(),
    }
}

fn missing_role(record: &DataRecord, role: &str) -> StageError {
    StageError::MissingPrerequisite(format!("sample '{}' has no '{role}' file", record.name))
}

fn required_file<'a>(record: &'a DataRecord, role: &str) -> Result<&'a Path, StageError> {
    record.file(role).ok_or_else(|| missing_role(record, role))
}

/// Files under `role` itself or its indexed batch roles, in index order.
fn role_files<'a>(record: &'a DataRecord, role: &str) -> Vec<&'a Path> {
    let prefix = format!("{role}.");
    let mut indexed: Vec<(usize, &Path)> = record
        .files
        .iter()
        .filter_map(|(name, path)| {
            let index = name.strip_prefix(&prefix)?.parse().ok()?;
            Some((index, path.as_path()))
        })
        .collect();
    indexed.sort_by_key(|(i, _)| *i);

    let mut files: Vec<&Path> = record.file(role).into_iter().collect();
    files.extend(indexed.into_iter().map(|(_, path)| path));
    files
}

fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-:=+@,".contains(c));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

fn shell_quote_path(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

// ---------------------------------------------------------------------------
// CommandStage
// ---------------------------------------------------------------------------

/// A stage that runs a shell command per item.
#[derive(Debug)]
pub struct CommandStage {
    name: String,
    programs: Vec<String>,
    split: SplitStrategy,
    input_role: String,
    output: OutputSpec,
    template: CommandTemplate,
}

impl CommandStage {
    pub fn new(definition: &StageDefinition) -> Result<Self, TemplateError> {
        Ok(Self {
            name: definition.name.clone(),
            programs: definition.programs.clone(),
            split: definition.split,
            input_role: definition.input.clone(),
            output: OutputSpec::new(&definition.output, &definition.extension),
            template: CommandTemplate::parse(&definition.name, &definition.command)?,
        })
    }

    async fn execute(&self, item: WorkItem, alloc: &Allocation) -> Result<Vec<DataRecord>, StageError> {
        let target: PathBuf = item.target.clone().ok_or_else(|| {
            StageError::Failed(format!("stage '{}' was given no output path", self.name))
        })?;
        // Only split chunks may vanish; whole samples and batches keep a placeholder.
        let chunk = item.record.metadata.contains_key("chunk");

        let work = &item;
        let written = with_transaction(std::slice::from_ref(&target), |paths| async move {
            let command = self.template.render(work, &self.input_role, alloc, &paths[0])?;
            tracing::debug!(
                stage = self.name.as_str(),
                item = work.label().as_str(),
                command = command.as_str(),
                "running command"
            );
            run_shell(&command, None).await?;
            let len = tokio::fs::metadata(&paths[0]).await.map(|m| m.len()).unwrap_or(0);
            Ok::<_, StageError>(len)
        })
        .await?;

        if written == 0 {
            write_placeholder(&target).await?;
            if chunk {
                return Err(StageError::EmptyInput(format!(
                    "{} produced no output for {}",
                    self.name,
                    item.label()
                )));
            }
            tracing::debug!(stage = self.name.as_str(), item = item.label().as_str(), "empty output, wrote placeholder");
        }

        let mut record = item.record;
        record.set_file(self.output.role.clone(), target);
        Ok(vec![record])
    }
}

impl Stage for CommandStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn programs(&self) -> &[String] {
        &self.programs
    }

    fn split(&self) -> SplitStrategy {
        self.split
    }

    fn input_role(&self) -> &str {
        &self.input_role
    }

    fn output(&self) -> Option<&OutputSpec> {
        Some(&self.output)
    }

    fn run<'a>(&'a self, item: WorkItem, resources: &'a Allocation) -> StageFuture<'a> {
        Box::pin(self.execute(item, resources))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seqflow_types::record::Region;
    use tempfile::TempDir;

    fn definition(command: &str) -> StageDefinition {
        StageDefinition {
            name: "copy".to_string(),
            command: command.to_string(),
            programs: vec![],
            split: SplitStrategy::None,
            input: "input".to_string(),
            output: "copied".to_string(),
            extension: ".txt".to_string(),
        }
    }

    fn alloc() -> Allocation {
        Allocation {
            workers: 1,
            cores_per_worker: 4,
            memory_per_worker: "2g".parse().ok(),
            jvm_opts: vec!["-Xmx2g".to_string()],
        }
    }

    #[test]
    fn test_template_renders_every_placeholder() {
        let template = CommandTemplate::parse(
            "call",
            "tool -t {cores} -m {memory} {jvm_opts} -s {sample} -r {region} {input:bam} {{x}} > {output}",
        )
        .unwrap();
        let record = DataRecord::new("s1").with_file("bam", "/data/s 1.bam");
        let mut item = WorkItem::new("call", record);
        item.region = Some(Region::contig("chr1"));

        let line = template
            .render(&item, "input", &alloc(), Path::new("/w/out.vcf"))
            .unwrap();
        assert_eq!(
            line,
            "tool -t 4 -m 2048 -Xmx2g -s s1 -r chr1 '/data/s 1.bam' {x} > /w/out.vcf"
        );
    }

    #[test]
    fn test_inputs_lists_batch_members_in_order() {
        let template = CommandTemplate::parse("joint", "call {inputs:bam}").unwrap();
        let mut record = DataRecord::new("fam");
        for i in [2, 0, 1] {
            record.set_file(format!("bam.{i}"), format!("/d/{i}.bam"));
        }
        let item = WorkItem::new("joint", record);
        let line = template
            .render(&item, "bam", &alloc(), Path::new("/o"))
            .unwrap();
        assert_eq!(line, "call /d/0.bam /d/1.bam /d/2.bam");
    }

    #[test]
    fn test_bad_templates_rejected() {
        assert!(matches!(
            CommandTemplate::parse("x", "run {bogus}"),
            Err(TemplateError::UnknownPlaceholder { placeholder, .. }) if placeholder == "bogus"
        ));
        assert!(matches!(
            CommandTemplate::parse("x", "run {input"),
            Err(TemplateError::Unclosed { .. })
        ));
    }

    #[test]
    fn test_missing_input_is_missing_prerequisite() {
        let template = CommandTemplate::parse("x", "cat {input}").unwrap();
        let item = WorkItem::new("x", DataRecord::new("s1"));
        assert!(matches!(
            template.render(&item, "input", &alloc(), Path::new("/o")),
            Err(StageError::MissingPrerequisite(_))
        ));
    }

    #[tokio::test]
    async fn test_command_stage_writes_output_transactionally() {
        let tmp = TempDir::new().unwrap();
        let input = tmp.path().join("s1.txt");
        std::fs::write(&input, "hello\n").unwrap();
        let target = tmp.path().join("copy/s1.txt");

        let stage = CommandStage::new(&definition("cat {input} > {output}")).unwrap();
        let mut item = WorkItem::new("copy", DataRecord::new("s1").with_file("input", &input));
        item.target = Some(target.clone());

        let records = stage.run(item, &alloc()).await.unwrap();
        assert_eq!(records[0].file("copied"), Some(target.as_path()));
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "hello\n");
    }

    #[tokio::test]
    async fn test_failed_command_leaves_no_output() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("copy/s1.txt");
        let stage = CommandStage::new(&definition("echo partial > {output}; exit 1")).unwrap();
        let mut item = WorkItem::new("copy", DataRecord::new("s1"));
        item.target = Some(target.clone());

        let err = stage.run(item, &alloc()).await.unwrap_err();
        assert!(matches!(err, StageError::Tool { .. }));
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_empty_chunk_output_is_skippable() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("copy/s1-split/s1-chr2.txt");
        let stage = CommandStage::new(&definition("true > {output}")).unwrap();
        let mut record = DataRecord::new("s1");
        record.metadata.insert("chunk".into(), "chr2".into());
        let mut item = WorkItem::new("copy", record);
        item.region = Some(Region::contig("chr2"));
        item.target = Some(target.clone());

        let err = stage.run(item, &alloc()).await.unwrap_err();
        assert!(err.is_empty_input());
        assert_eq!(std::fs::metadata(&target).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_empty_regional_output_keeps_record() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("copy/fam-chr1.txt");
        let stage = CommandStage::new(&definition("true {output}")).unwrap();
        let mut record = DataRecord::new("fam").with_batch("fam");
        record.region = Some(Region::contig("chr1"));
        let mut item = WorkItem::new("copy", record);
        item.region = Some(Region::contig("chr1"));
        item.target = Some(target.clone());

        let records = stage.run(item, &alloc()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].file("copied"), Some(target.as_path()));
        assert_eq!(std::fs::metadata(&target).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_empty_whole_sample_output_keeps_record() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("copy/s1.txt");
        let stage = CommandStage::new(&definition("true")).unwrap();
        let mut item = WorkItem::new("copy", DataRecord::new("s1"));
        item.target = Some(target.clone());

        let records = stage.run(item, &alloc()).await.unwrap();
        assert_eq!(records[0].file("copied"), Some(target.as_path()));
        assert!(target.exists());
    }
}
