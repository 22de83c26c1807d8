//! Free-slot queries against grid schedulers.
//!
//! Each family is queried with its usual status command and the output is
//! parsed by a pure function so the parsers can be tested without a
//! scheduler.

use seqflow_core::resources::SlotQuery;
use seqflow_types::config::SchedulerFamily;

use crate::process::run_tool;

/// `SlotQuery` that shells out to the scheduler's status command.
#[derive(Debug, Default, Clone)]
pub struct GridSlots;

impl SlotQuery for GridSlots {
    async fn free_slots(&self, scheduler: SchedulerFamily, queue: &str) -> Result<u32, String> {
        let (tool, args): (&str, Vec<&str>) = match scheduler {
            SchedulerFamily::Sge => ("qstat", vec!["-g", "c"]),
            SchedulerFamily::Slurm => ("sinfo", vec!["-h", "-o", "%C", "-p", queue]),
            SchedulerFamily::Lsf => ("bhosts", vec!["-w"]),
            SchedulerFamily::Torque | SchedulerFamily::Pbspro => ("pbsnodes", vec!["-a"]),
        };
        let output = run_tool(tool, args).await.map_err(|e| e.to_string())?;
        let text = output.stdout_lossy();
        let slots = match scheduler {
            SchedulerFamily::Sge => parse_sge(&text, queue),
            SchedulerFamily::Slurm => parse_slurm(&text),
            SchedulerFamily::Lsf => parse_lsf(&text),
            SchedulerFamily::Torque | SchedulerFamily::Pbspro => parse_pbsnodes(&text),
        }?;
        tracing::debug!(?scheduler, queue, slots, "queried free grid slots");
        Ok(slots)
    }
}

/// `qstat -g c`: sum the AVAIL column for `queue` (all queues when empty).
///
/// The header starts with the two-word `CLUSTER QUEUE`, so data columns sit
/// one position left of their header token.
pub fn parse_sge(text: &str, queue: &str) -> Result<u32, String> {
    let mut lines = text.lines();
    let header = lines
        .find(|l| l.contains("AVAIL"))
        .ok_or_else(|| "qstat output has no AVAIL column".to_string())?;
    let avail = header
        .split_whitespace()
        .position(|col| col == "AVAIL")
        .and_then(|i| i.checked_sub(1))
        .ok_or_else(|| "unexpected qstat header".to_string())?;

    let mut total = 0;
    for line in lines.filter(|l| !l.starts_with('-')) {
        let cols: Vec<&str> = line.split_whitespace().collect();
        let Some(name) = cols.first() else { continue };
        if !queue.is_empty() && *name != queue {
            continue;
        }
        if let Some(n) = cols.get(avail).and_then(|v| v.parse::<u32>().ok()) {
            total += n;
        }
    }
    Ok(total)
}

/// `sinfo -h -o %C`: the idle field of `allocated/idle/other/total`.
pub fn parse_slurm(text: &str) -> Result<u32, String> {
    let mut total = 0;
    let mut seen = false;
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let idle = line
            .split('/')
            .nth(1)
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or_else(|| format!("unexpected sinfo line '{line}'"))?;
        total += idle;
        seen = true;
    }
    if !seen {
        return Err("sinfo returned no partitions".to_string());
    }
    Ok(total)
}

/// `bhosts -w`: `MAX - NJOBS` over hosts whose status is `ok`.
pub fn parse_lsf(text: &str) -> Result<u32, String> {
    let mut lines = text.lines();
    let header: Vec<&str> = lines
        .next()
        .ok_or_else(|| "empty bhosts output".to_string())?
        .split_whitespace()
        .collect();
    let col = |name: &str| {
        header
            .iter()
            .position(|c| *c == name)
            .ok_or_else(|| format!("bhosts output has no {name} column"))
    };
    let (status, max, njobs) = (col("STATUS")?, col("MAX")?, col("NJOBS")?);

    let mut total = 0;
    for line in lines {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.get(status) != Some(&"ok") {
            continue;
        }
        let parse = |i: usize| cols.get(i).and_then(|v| v.parse::<u32>().ok());
        if let (Some(max), Some(running)) = (parse(max), parse(njobs)) {
            total += max.saturating_sub(running);
        }
    }
    Ok(total)
}

/// `pbsnodes -a`: cores minus running jobs over nodes in state `free`.
///
/// Torque reports cores as `np`, PBS Pro as `resources_available.ncpus`.
pub fn parse_pbsnodes(text: &str) -> Result<u32, String> {
    let mut total = 0;
    let mut nodes = 0;
    for block in text.split("\n\n").filter(|b| !b.trim().is_empty()) {
        nodes += 1;
        let mut free = false;
        let mut cores = 0u32;
        let mut jobs = 0u32;
        for line in block.lines().skip(1) {
            let Some((key, value)) = line.split_once('=') else { continue };
            let value = value.trim();
            match key.trim() {
                "state" => free = value == "free",
                "np" | "resources_available.ncpus" => cores = value.parse().unwrap_or(0),
                "jobs" => jobs = value.split(',').filter(|j| !j.trim().is_empty()).count() as u32,
                _ => {}
            }
        }
        if free {
            total += cores.saturating_sub(jobs);
        }
    }
    if nodes == 0 {
        return Err("pbsnodes returned no nodes".to_string());
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sge_avail_column() {
        let text = "\
CLUSTER QUEUE                   CQLOAD   USED    RES  AVAIL  TOTAL aoACDS  cdsuE
--------------------------------------------------------------------------------
all.q                             0.02     10      0     38     48      0      0
long.q                            0.50      4      0     12     16      0      0
";
        assert_eq!(parse_sge(text, "all.q").unwrap(), 38);
        assert_eq!(parse_sge(text, "").unwrap(), 50);
        assert_eq!(parse_sge(text, "missing.q").unwrap(), 0);
        assert!(parse_sge("garbage", "all.q").is_err());
    }

    #[test]
    fn test_slurm_idle_cpus() {
        assert_eq!(parse_slurm("12/36/0/48\n").unwrap(), 36);
        assert_eq!(parse_slurm("1/2/0/3\n4/5/0/9\n").unwrap(), 7);
        assert!(parse_slurm("").is_err());
        assert!(parse_slurm("n/a").is_err());
    }

    #[test]
    fn test_lsf_ok_hosts_only() {
        let text = "\
HOST_NAME          STATUS       JL/U    MAX  NJOBS    RUN  SSUSP  USUSP    RSV
node1              ok              -     16      4      4      0      0      0
node2              closed_Full     -     16     16     16      0      0      0
node3              ok              -      8      0      0      0      0      0
";
        assert_eq!(parse_lsf(text).unwrap(), 20);
    }

    #[test]
    fn test_torque_and_pbspro_nodes() {
        let text = "\
node1
     state = free
     np = 16
     jobs = 0/101.server, 1/102.server

node2
     state = job-exclusive
     np = 16

node3
     state = free
     resources_available.ncpus = 8
";
        assert_eq!(parse_pbsnodes(text).unwrap(), 22);
        assert!(parse_pbsnodes("").is_err());
    }
}
