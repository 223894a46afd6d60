//! The one structured record shape written to a trace file, covering all
//! three kinds of sample the agent emits (spec §6.3), grounded on
//! `DataEndpoint.record`
//! (`examples/original_source/schedulerlocal/dataendpoint/dataendpoint.py`).

use serde::{Deserialize, Serialize};

/// What a `Record` describes: a whole-node total, one subset's usage, or
/// one VM's share of a subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Global,
    Subset,
    Vm,
}

/// One CSV row. Field presence mirrors the original's per-`rec`-kind
/// validation: `subset`/`sb_oc`/`sb_unused`/`sb_dsc` are required for
/// `Subset` rows, `subset`/`vm_uuid`/`vm_cmn`/`sb_oc` for `Vm` rows,
/// nothing extra for `Global` rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub tmp: i64,
    pub rec: RecordKind,
    pub res: String,
    pub val: Option<f64>,
    pub config: f64,
    pub subset: Option<String>,
    pub vm_uuid: Option<String>,
    pub vm_cmn: Option<String>,
    pub sb_oc: Option<String>,
    pub sb_unused: Option<f64>,
    pub sb_dsc: Option<String>,
}

impl Record {
    pub fn global(tmp: i64, res: impl Into<String>, val: Option<f64>, config: f64) -> Self {
        Self {
            tmp,
            rec: RecordKind::Global,
            res: res.into(),
            val,
            config,
            subset: None,
            vm_uuid: None,
            vm_cmn: None,
            sb_oc: None,
            sb_unused: None,
            sb_dsc: None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn subset(
        tmp: i64,
        res: impl Into<String>,
        val: Option<f64>,
        config: f64,
        subset: impl Into<String>,
        sb_oc: impl Into<String>,
        sb_unused: f64,
        sb_dsc: impl Into<String>,
    ) -> Self {
        Self {
            tmp,
            rec: RecordKind::Subset,
            res: res.into(),
            val,
            config,
            subset: Some(subset.into()),
            vm_uuid: None,
            vm_cmn: None,
            sb_oc: Some(sb_oc.into()),
            sb_unused: Some(sb_unused),
            sb_dsc: Some(sb_dsc.into()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn vm(
        tmp: i64,
        res: impl Into<String>,
        val: Option<f64>,
        config: f64,
        subset: impl Into<String>,
        vm_uuid: impl Into<String>,
        vm_cmn: impl Into<String>,
        sb_oc: impl Into<String>,
    ) -> Self {
        Self {
            tmp,
            rec: RecordKind::Vm,
            res: res.into(),
            val,
            config,
            subset: Some(subset.into()),
            vm_uuid: Some(vm_uuid.into()),
            vm_cmn: Some(vm_cmn.into()),
            sb_oc: Some(sb_oc.into()),
            sb_unused: None,
            sb_dsc: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_record_leaves_subset_fields_empty() {
        let r = Record::global(10, "cpu", Some(1.5), 8.0);
        assert!(r.subset.is_none());
        assert_eq!(r.rec, RecordKind::Global);
    }

    #[test]
    fn vm_record_carries_identity_fields() {
        let r = Record::vm(10, "cpu", Some(0.3), 4.0, "subset-1.0", "u-1", "vm-a", "1.0");
        assert_eq!(r.vm_uuid.as_deref(), Some("u-1"));
        assert_eq!(r.subset.as_deref(), Some("subset-1.0"));
    }
}
