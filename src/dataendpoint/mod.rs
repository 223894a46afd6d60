//! Abstract load/store of per-timestamp resource samples (spec §6.3),
//! decoupling the manager pool's monitoring pass from where usage numbers
//! come from: the live hypervisor connector, a replayed CSV trace, or a
//! recording sink that writes both back out. Grounded on `DataEndpoint`/
//! `DataEndpointPool`
//! (`examples/original_source/schedulerlocal/dataendpoint/dataendpoint.py`,
//! `dataendpointpool.py`) — tagged variants instead of a class hierarchy
//! (Design Note "dynamic dispatch (Endpoint subclasses)").

pub mod record;
pub mod trace;

use crate::domain::DomainEntity;
use crate::error::{SchedulerError, SchedulerResult};
use record::{Record, RecordKind};
use std::fs::File;
use std::path::Path;

/// Write side of a data endpoint: every sample the local agent produces
/// during one `iterate(t)` pass, regardless of whether it came from the
/// live connector or a replayed trace. Live mode normally runs without a
/// sink (`None` in `ManagerPool::iterate`); passing one records telemetry
/// to a CSV file as the original's `DataEndpointCSV` does for its output
/// trace.
pub trait DataSink: Send {
    fn store_global(&mut self, tmp: i64, res: &str, val: Option<f64>, config: f64) -> SchedulerResult<()>;

    #[allow(clippy::too_many_arguments)]
    fn store_subset(
        &mut self,
        tmp: i64,
        res: &str,
        subset_id: &str,
        val: Option<f64>,
        config: f64,
        oc: f64,
        unused: f64,
    ) -> SchedulerResult<()>;

    fn store_vm(
        &mut self,
        tmp: i64,
        res: &str,
        subset_id: &str,
        vm: &DomainEntity,
        val: Option<f64>,
        oc: f64,
    ) -> SchedulerResult<()>;

    fn flush(&mut self) -> SchedulerResult<()>;
}

/// Tab-separated trace writer (spec §6.3): re-emits the same schema the
/// reader (`trace::CsvTrace`) consumes, header on line 1. `val`/`sb_unused`
/// use the literal string `None` for a missing observation rather than an
/// empty field, matching the reader's `parse_optional_f64`.
pub struct CsvWriter {
    inner: csv::Writer<File>,
}

impl CsvWriter {
    pub fn create(path: impl AsRef<Path>) -> SchedulerResult<Self> {
        let mut inner = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .from_path(path.as_ref())
            .map_err(|e| SchedulerError::TraceFormat(e.to_string()))?;
        inner
            .write_record([
                "tmp", "rec", "res", "val", "config", "subset", "vm_uuid", "vm_cmn", "sb_oc", "sb_unused", "sb_dsc",
            ])
            .map_err(|e| SchedulerError::TraceFormat(e.to_string()))?;
        Ok(Self { inner })
    }

    fn write(&mut self, record: &Record) -> SchedulerResult<()> {
        let rec = match record.rec {
            RecordKind::Global => "global",
            RecordKind::Subset => "subset",
            RecordKind::Vm => "vm",
        };
        let fields = [
            record.tmp.to_string(),
            rec.to_string(),
            record.res.clone(),
            opt_f64(record.val),
            record.config.to_string(),
            opt_str(&record.subset),
            opt_str(&record.vm_uuid),
            opt_str(&record.vm_cmn),
            opt_str(&record.sb_oc),
            opt_f64(record.sb_unused),
            opt_str(&record.sb_dsc),
        ];
        self.inner
            .write_record(&fields)
            .map_err(|e| SchedulerError::TraceFormat(e.to_string()))
    }
}

fn opt_f64(v: Option<f64>) -> String {
    v.map(|x| x.to_string()).unwrap_or_else(|| "None".to_string())
}

fn opt_str(v: &Option<String>) -> String {
    v.clone().unwrap_or_else(|| "None".to_string())
}

impl DataSink for CsvWriter {
    fn store_global(&mut self, tmp: i64, res: &str, val: Option<f64>, config: f64) -> SchedulerResult<()> {
        self.write(&Record::global(tmp, res, val, config))
    }

    fn store_subset(
        &mut self,
        tmp: i64,
        res: &str,
        subset_id: &str,
        val: Option<f64>,
        config: f64,
        oc: f64,
        unused: f64,
    ) -> SchedulerResult<()> {
        self.write(&Record::subset(
            tmp,
            res,
            val,
            config,
            subset_id,
            oc.to_string(),
            unused,
            "",
        ))
    }

    fn store_vm(
        &mut self,
        tmp: i64,
        res: &str,
        subset_id: &str,
        vm: &DomainEntity,
        val: Option<f64>,
        oc: f64,
    ) -> SchedulerResult<()> {
        let config = if res == "mem" { vm.mem_kb() as f64 } else { vm.cpu() as f64 };
        self.write(&Record::vm(
            tmp,
            res,
            val,
            config,
            subset_id,
            vm.uuid().unwrap_or("").to_string(),
            vm.name().to_string(),
            oc.to_string(),
        ))
    }

    fn flush(&mut self) -> SchedulerResult<()> {
        self.inner.flush().map_err(|e| SchedulerError::TraceFormat(e.to_string()))
    }
}

/// A sink that discards everything — used whenever the caller wants the
/// recording call sites exercised without actually persisting output
/// (e.g. a dry-run local agent).
#[derive(Debug, Default)]
pub struct NullSink;

impl DataSink for NullSink {
    fn store_global(&mut self, _tmp: i64, _res: &str, _val: Option<f64>, _config: f64) -> SchedulerResult<()> {
        Ok(())
    }

    fn store_subset(
        &mut self,
        _tmp: i64,
        _res: &str,
        _subset_id: &str,
        _val: Option<f64>,
        _config: f64,
        _oc: f64,
        _unused: f64,
    ) -> SchedulerResult<()> {
        Ok(())
    }

    fn store_vm(
        &mut self,
        _tmp: i64,
        _res: &str,
        _subset_id: &str,
        _vm: &DomainEntity,
        _val: Option<f64>,
        _oc: f64,
    ) -> SchedulerResult<()> {
        Ok(())
    }

    fn flush(&mut self) -> SchedulerResult<()> {
        Ok(())
    }
}

/// The subset-id wire format shared by the writer and `trace::CsvTrace`'s
/// reader: `{numa}:{ratio}` keeps every NUMA node's ratio groups distinct
/// in a single flat trace file.
pub fn subset_wire_id(numa_id: u32, ratio: f64) -> String {
    format!("{numa_id}:{ratio}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataendpoint::trace::CsvTrace;

    #[test]
    fn writer_reader_roundtrip_global_and_vm_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.csv");
        {
            let mut writer = CsvWriter::create(&path).unwrap();
            writer.store_global(0, "cpu", Some(1.5), 8.0).unwrap();
            let vm = DomainEntity::builder("vm-a", 1024 * 1024, 2, 1.0).uuid("u-1").build();
            writer.store_vm(0, "cpu", "0:1", &vm, Some(0.3), 1.0).unwrap();
            writer.flush().unwrap();
        }
        let trace = CsvTrace::load(&path).unwrap();
        assert_eq!(trace.load_global("cpu", 0), Some(1.5));
        let (_, vm_usage) = trace.load_subset("cpu", "0:1", 0);
        assert_eq!(vm_usage.len(), 1);
        assert_eq!(vm_usage[0].1, Some(0.3));
    }

    #[test]
    fn subset_wire_id_keys_by_numa_and_ratio() {
        assert_eq!(subset_wire_id(0, 1.0), "0:1");
        assert_ne!(subset_wire_id(0, 1.0), subset_wire_id(1, 1.0));
    }
}
