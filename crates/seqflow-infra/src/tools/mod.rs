//! `FormatTools` adapter backed by samtools, bcftools and native FASTQ/text
//! handling.

pub mod fastq;
pub mod text;

use std::path::{Path, PathBuf};

use seqflow_core::tools::{FormatTools, ReadChunkPlan, ToolError};
use tokio::process::Command;

use crate::process::run_command;
use crate::transaction::with_transaction;

pub use text::write_placeholder;

/// Names of the external binaries, overridable for non-standard installs.
#[derive(Debug, Clone)]
pub struct ExternalTools {
    pub samtools: String,
    pub bcftools: String,
}

impl Default for ExternalTools {
    fn default() -> Self {
        Self {
            samtools: "samtools".to_string(),
            bcftools: "bcftools".to_string(),
        }
    }
}

/// Reference names from the `@SQ` lines of a SAM header.
pub fn parse_reference_names(header: &str) -> Vec<String> {
    header
        .lines()
        .filter(|line| line.starts_with("@SQ"))
        .filter_map(|line| {
            line.split('\t')
                .find_map(|field| field.strip_prefix("SN:"))
                .map(str::to_string)
        })
        .collect()
}

fn is_bgzipped_variants(path: &Path) -> bool {
    path.to_string_lossy().ends_with(".vcf.gz")
}

fn is_aligned(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "bam" || ext == "cram")
}

impl ExternalTools {
    fn samtools(&self) -> Command {
        Command::new(&self.samtools)
    }

    fn bcftools(&self) -> Command {
        Command::new(&self.bcftools)
    }

    async fn tabix_index(&self, path: &Path) -> Result<(), ToolError> {
        let mut cmd = self.bcftools();
        cmd.args(["index", "-f", "-t"]).arg(path);
        run_command(&self.bcftools, cmd).await?;
        Ok(())
    }
}

impl FormatTools for ExternalTools {
    async fn reference_names(&self, aligned: &Path) -> Result<Vec<String>, ToolError> {
        let mut cmd = self.samtools();
        cmd.args(["view", "-H"]).arg(aligned);
        let out = run_command(&self.samtools, cmd).await?;
        let names = parse_reference_names(&out.stdout_lossy());
        if names.is_empty() {
            return Err(ToolError::Malformed {
                path: aligned.to_path_buf(),
                message: "header lists no reference sequences".to_string(),
            });
        }
        Ok(names)
    }

    async fn name_sort(&self, input: &Path, output: &Path, cores: u32) -> Result<(), ToolError> {
        let mut cmd = self.samtools();
        cmd.args(["sort", "-n", "-@"])
            .arg(cores.max(1).to_string())
            .arg("-o")
            .arg(output)
            .arg(input);
        run_command(&self.samtools, cmd).await?;
        Ok(())
    }

    async fn to_fastq(&self, input: &Path, outputs: &[PathBuf; 2]) -> Result<bool, ToolError> {
        let mut cmd = self.samtools();
        cmd.args(["fastq", "-n", "-1"])
            .arg(&outputs[0])
            .arg("-2")
            .arg(&outputs[1])
            .args(["-0", "/dev/null", "-s", "/dev/null"])
            .arg(input);
        run_command(&self.samtools, cmd).await?;

        // Single-end reads land in the discarded -0 stream, leaving mate 2 empty.
        let mate2 = tokio::fs::metadata(&outputs[1]).await.map(|m| m.len()).unwrap_or(0);
        if mate2 == 0 {
            let mut cmd = self.samtools();
            cmd.args(["fastq", "-n", "-0"]).arg(&outputs[0]).arg(input);
            run_command(&self.samtools, cmd).await?;
        }
        Ok(mate2 > 0)
    }

    async fn count_reads(&self, path: &Path) -> Result<u64, ToolError> {
        fastq::count_reads(path).await
    }

    async fn write_read_chunks(
        &self,
        inputs: &[PathBuf],
        chunks: &[ReadChunkPlan],
    ) -> Result<(), ToolError> {
        fastq::write_chunks(inputs, chunks).await
    }

    // Writers below index the temp path so the index commits with its file.

    async fn merge_sorted(&self, inputs: &[PathBuf], output: &Path, cores: u32) -> Result<(), ToolError> {
        with_transaction(&[output.to_path_buf()], |paths| async move {
            let tx_out = &paths[0];
            let mut cmd = self.samtools();
            cmd.args(["merge", "-f", "-@"])
                .arg(cores.max(1).to_string())
                .arg(tx_out)
                .args(inputs);
            run_command(&self.samtools, cmd).await?;

            let mut cmd = self.samtools();
            cmd.arg("index").arg(tx_out);
            run_command(&self.samtools, cmd).await?;
            Ok::<_, ToolError>(())
        })
        .await
    }

    async fn concat(&self, inputs: &[PathBuf], output: &Path, header_prefix: &str) -> Result<(), ToolError> {
        if !is_bgzipped_variants(output) {
            return text::concat(inputs, output, header_prefix).await;
        }
        with_transaction(&[output.to_path_buf()], |paths| async move {
            let tx_out = &paths[0];
            let mut cmd = self.bcftools();
            cmd.args(["concat", "-Oz", "-o"]).arg(tx_out).args(inputs);
            run_command(&self.bcftools, cmd).await?;
            self.tabix_index(tx_out).await
        })
        .await
    }

    async fn extract_sample(&self, combined: &Path, sample: &str, output: &Path) -> Result<(), ToolError> {
        if is_aligned(combined) {
            return Err(ToolError::Malformed {
                path: combined.to_path_buf(),
                message: "sample extraction supports variant outputs only".to_string(),
            });
        }
        let bgzipped = is_bgzipped_variants(output);
        with_transaction(&[output.to_path_buf()], |paths| async move {
            let tx_out = &paths[0];
            let mut cmd = self.bcftools();
            cmd.args(["view", "-s", sample, if bgzipped { "-Oz" } else { "-Ov" }, "-o"])
                .arg(tx_out)
                .arg(combined);
            run_command(&self.bcftools, cmd).await?;
            if bgzipped {
                self.tabix_index(tx_out).await?;
            }
            Ok::<_, ToolError>(())
        })
        .await
    }

    async fn link(&self, src: &Path, dest: &Path) -> Result<(), ToolError> {
        text::link(src, dest).await
    }

    async fn write_placeholder(&self, output: &Path) -> Result<(), ToolError> {
        text::write_placeholder(output).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_reference_names() {
        let header = "@HD\tVN:1.6\tSO:coordinate\n\
                      @SQ\tSN:chr1\tLN:248956422\n\
                      @SQ\tSN:chr2\tLN:242193529\n\
                      @RG\tID:s1\tSM:s1\n\
                      @SQ\tLN:1000\tSN:chrM\n";
        assert_eq!(parse_reference_names(header), ["chr1", "chr2", "chrM"]);
    }

    #[test]
    fn test_format_detection() {
        assert!(is_bgzipped_variants(Path::new("/w/s1.vcf.gz")));
        assert!(!is_bgzipped_variants(Path::new("/w/s1.vcf")));
        assert!(is_aligned(Path::new("s1.cram")));
        assert!(!is_aligned(Path::new("s1.fastq")));
    }

    #[tokio::test]
    async fn test_plain_concat_uses_native_path() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("0000.txt");
        let b = tmp.path().join("0001.txt");
        std::fs::write(&a, "#cols\n1\n").unwrap();
        std::fs::write(&b, "#cols\n2\n").unwrap();
        let out = tmp.path().join("all.txt");

        ExternalTools::default()
            .concat(&[a, b], &out, "#")
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "#cols\n1\n2\n");
    }

    #[tokio::test]
    async fn test_failed_combine_is_retried_from_scratch() {
        use seqflow_core::split::{Combiner, chunk_path};
        use seqflow_types::config::{ChunkCleanup, SplitConfig};
        use seqflow_types::manifest::ChunkManifest;
        use std::sync::Arc;

        let tmp = TempDir::new().unwrap();
        let parent = tmp.path().join("call/s1.vcf");
        let chr1 = chunk_path(&parent, "chr1");
        let chr2 = chunk_path(&parent, "chr2");
        std::fs::create_dir_all(chr1.parent().unwrap()).unwrap();
        std::fs::write(&chr1, "#h\nchr1\t1\n").unwrap();
        std::fs::write(&chr2, b"#h\nchr2\t\xff\n").unwrap();
        let manifest =
            ChunkManifest::from_entries(&parent, [("chr1", chr1.clone()), ("chr2", chr2.clone())]).unwrap();
        let combiner = Combiner::new(
            Arc::new(ExternalTools::default()),
            SplitConfig {
                cleanup: ChunkCleanup::Keep,
                ..SplitConfig::default()
            },
        );

        assert!(combiner.combine(&manifest, 1).await.is_err());
        assert!(!parent.exists(), "a failed combine must not leave a parent behind");

        std::fs::write(&chr2, "#h\nchr2\t2\n").unwrap();
        let combined = combiner.combine(&manifest, 1).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(combined).unwrap(),
            "#h\nchr1\t1\nchr2\t2\n"
        );
    }

    #[tokio::test]
    async fn test_missing_binary_surfaces_spawn_error() {
        let tools = ExternalTools {
            samtools: "seqflow-missing-samtools".to_string(),
            ..ExternalTools::default()
        };
        let err = tools
            .reference_names(Path::new("/nonexistent.bam"))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }));
    }
}
