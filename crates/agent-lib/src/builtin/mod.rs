//! Builtin commands.
//!
//! `ping` answers the protocol liveness probe; `monitor` samples one host
//! domain (cpu, memory, disk, network) and feeds the readings through the
//! aggregator. Monitor probes check the cancellation token between steps,
//! so a kill takes effect at the next probe boundary.

use serde::Deserialize;
use serde_json::{json, Value};
use sysinfo::{Disks, Networks, System};

use crate::error::{AgentError, Result};
use crate::pm::{AggregateOp, ExecContext, FactoryRegistry};

const MIB: f64 = 1024.0 * 1024.0;

/// Registers the builtin command factories.
pub fn register_builtins(registry: &mut FactoryRegistry) {
    registry.register_internal("ping", |_ctx| async { Ok(json!("pong")) });
    registry.register_internal("monitor", monitor);
}

#[derive(Debug, Deserialize)]
struct MonitorArguments {
    #[serde(default)]
    domain: String,
}

async fn monitor(ctx: ExecContext) -> Result<Value> {
    let args: MonitorArguments = serde_json::from_value(ctx.cmd().arguments.clone())?;

    match args.domain.to_lowercase().as_str() {
        "cpu" => monitor_cpu(&ctx).await?,
        "memory" => monitor_memory(&ctx)?,
        "disk" => monitor_disk(&ctx).await?,
        "network" => monitor_network(&ctx)?,
        other => {
            return Err(AgentError::validation(format!(
                "invalid monitoring domain: {other}"
            )))
        }
    }

    Ok(Value::Null)
}

async fn monitor_cpu(ctx: &ExecContext) -> Result<()> {
    let mut sys = System::new();
    sys.refresh_cpu_usage();
    tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
    if ctx.is_cancelled() {
        return Err(AgentError::Canceled);
    }
    sys.refresh_cpu_usage();

    for (nr, cpu) in sys.cpus().iter().enumerate() {
        ctx.aggregate(
            AggregateOp::Average,
            "machine.CPU.percent",
            cpu.cpu_usage() as f64,
            &nr.to_string(),
            &[("type", "phys")],
        );
    }

    let stat = tokio::fs::read_to_string("/proc/stat")
        .await
        .map_err(|e| AgentError::execution(format!("read /proc/stat failed: {e}")))?;
    let counters = parse_stat_counters(&stat);
    if let Some(ctxt) = counters.context_switches {
        ctx.aggregate(
            AggregateOp::Difference,
            "machine.CPU.contextswitch",
            ctxt,
            "",
            &[("type", "phys")],
        );
    }
    if let Some(intr) = counters.interrupts {
        ctx.aggregate(
            AggregateOp::Difference,
            "machine.CPU.interrupts",
            intr,
            "",
            &[("type", "phys")],
        );
    }

    if ctx.is_cancelled() {
        return Err(AgentError::Canceled);
    }

    if let Ok(loadavg) = tokio::fs::read_to_string("/proc/loadavg").await {
        if let Some(threads) = parse_loadavg_entities(&loadavg) {
            ctx.aggregate(
                AggregateOp::Average,
                "machine.process.threads",
                threads,
                "",
                &[("type", "phys")],
            );
        }
    }

    Ok(())
}

fn monitor_memory(ctx: &ExecContext) -> Result<()> {
    let mut sys = System::new();
    sys.refresh_memory();

    ctx.aggregate(
        AggregateOp::Average,
        "machine.memory.ram.available",
        sys.available_memory() as f64 / MIB,
        "",
        &[("type", "phys")],
    );
    ctx.aggregate(
        AggregateOp::Average,
        "machine.memory.swap.left",
        sys.free_swap() as f64 / MIB,
        "",
        &[("type", "phys")],
    );
    ctx.aggregate(
        AggregateOp::Average,
        "machine.memory.swap.used",
        sys.used_swap() as f64 / MIB,
        "",
        &[("type", "phys")],
    );

    Ok(())
}

async fn monitor_disk(ctx: &ExecContext) -> Result<()> {
    if let Ok(diskstats) = tokio::fs::read_to_string("/proc/diskstats").await {
        for counters in parse_diskstats(&diskstats) {
            ctx.aggregate(
                AggregateOp::Difference,
                "disk.iops.read",
                counters.reads,
                &counters.device,
                &[("type", "phys")],
            );
            ctx.aggregate(
                AggregateOp::Difference,
                "disk.iops.write",
                counters.writes,
                &counters.device,
                &[("type", "phys")],
            );
            ctx.aggregate(
                AggregateOp::Difference,
                "disk.throughput.read",
                counters.read_kib,
                &counters.device,
                &[("type", "phys")],
            );
            ctx.aggregate(
                AggregateOp::Difference,
                "disk.throughput.write",
                counters.write_kib,
                &counters.device,
                &[("type", "phys")],
            );
        }
    }

    if ctx.is_cancelled() {
        return Err(AgentError::Canceled);
    }

    let disks = Disks::new_with_refreshed_list();
    for disk in disks.list() {
        let name = disk.name().to_string_lossy().to_string();
        let fs = disk.file_system().to_string_lossy().to_string();
        ctx.aggregate(
            AggregateOp::Average,
            "disk.size.total",
            disk.total_space() as f64,
            &name,
            &[("type", "phys"), ("fs", &fs)],
        );
        ctx.aggregate(
            AggregateOp::Average,
            "disk.size.free",
            disk.available_space() as f64,
            &name,
            &[("type", "phys"), ("fs", &fs)],
        );
    }

    Ok(())
}

fn monitor_network(ctx: &ExecContext) -> Result<()> {
    let networks = Networks::new_with_refreshed_list();
    for (name, data) in &networks {
        if name == "lo" {
            continue;
        }
        ctx.aggregate(
            AggregateOp::Difference,
            "network.throughput.outgoing",
            data.total_transmitted() as f64 / MIB,
            name,
            &[("type", "phys")],
        );
        ctx.aggregate(
            AggregateOp::Difference,
            "network.throughput.incoming",
            data.total_received() as f64 / MIB,
            name,
            &[("type", "phys")],
        );
        ctx.aggregate(
            AggregateOp::Difference,
            "network.packets.tx",
            data.total_packets_transmitted() as f64,
            name,
            &[("type", "phys")],
        );
        ctx.aggregate(
            AggregateOp::Difference,
            "network.packets.rx",
            data.total_packets_received() as f64,
            name,
            &[("type", "phys")],
        );
    }

    Ok(())
}

#[derive(Debug, Default, PartialEq)]
struct StatCounters {
    context_switches: Option<f64>,
    interrupts: Option<f64>,
}

/// Pulls the `ctxt` and `intr` totals out of `/proc/stat`.
fn parse_stat_counters(content: &str) -> StatCounters {
    let mut counters = StatCounters::default();
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("ctxt"), Some(value)) => counters.context_switches = value.parse().ok(),
            (Some("intr"), Some(value)) => counters.interrupts = value.parse().ok(),
            _ => {}
        }
    }
    counters
}

/// Total scheduling entities from the `running/total` field of
/// `/proc/loadavg`.
fn parse_loadavg_entities(content: &str) -> Option<f64> {
    content
        .split_whitespace()
        .nth(3)?
        .split('/')
        .nth(1)?
        .parse()
        .ok()
}

#[derive(Debug, PartialEq)]
struct DiskCounters {
    device: String,
    reads: f64,
    writes: f64,
    read_kib: f64,
    write_kib: f64,
}

/// Parses `/proc/diskstats`, skipping virtual devices. Sectors are 512
/// bytes regardless of the device's logical block size.
fn parse_diskstats(content: &str) -> Vec<DiskCounters> {
    const SECTOR_KIB: f64 = 512.0 / 1024.0;

    let mut out = Vec::new();
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        let device = fields[2];
        if ["loop", "ram", "dm-", "sr", "zram"]
            .iter()
            .any(|p| device.starts_with(p))
        {
            continue;
        }
        let parse = |idx: usize| fields.get(idx).and_then(|v| v.parse::<f64>().ok());
        let (Some(reads), Some(sectors_read), Some(writes), Some(sectors_written)) =
            (parse(3), parse(5), parse(7), parse(9))
        else {
            continue;
        };
        out.push(DiskCounters {
            device: device.to_string(),
            reads,
            writes,
            read_kib: sectors_read * SECTOR_KIB,
            write_kib: sectors_written * SECTOR_KIB,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_counters_extracts_ctxt_and_intr() {
        let stat = "cpu  100 0 200 300\ncpu0 50 0 100 150\nintr 4242 1 2 3\nctxt 987654\nbtime 1700000000\n";
        let counters = parse_stat_counters(stat);
        assert_eq!(counters.context_switches, Some(987654.0));
        assert_eq!(counters.interrupts, Some(4242.0));
    }

    #[test]
    fn stat_counters_tolerates_missing_lines() {
        let counters = parse_stat_counters("cpu 1 2 3\n");
        assert_eq!(counters, StatCounters::default());
    }

    #[test]
    fn loadavg_entities_reads_the_denominator() {
        assert_eq!(
            parse_loadavg_entities("0.52 0.58 0.59 1/973 12345\n"),
            Some(973.0)
        );
        assert_eq!(parse_loadavg_entities("garbage"), None);
    }

    #[test]
    fn diskstats_skips_virtual_devices() {
        let content = "\
   8       0 sda 1000 0 20480 500 2000 0 40960 800 0 0 0\n\
   7       0 loop0 10 0 80 0 0 0 0 0 0 0 0\n\
 253       0 dm-0 50 0 400 0 60 0 480 0 0 0 0\n";
        let parsed = parse_diskstats(content);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].device, "sda");
        assert_eq!(parsed[0].reads, 1000.0);
        assert_eq!(parsed[0].writes, 2000.0);
        assert_eq!(parsed[0].read_kib, 10240.0);
        assert_eq!(parsed[0].write_kib, 20480.0);
    }
}
