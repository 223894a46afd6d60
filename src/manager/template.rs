//! Oversubscription templates: map a VM's request onto the subset ids it
//! should consume (spec §4.10), grounded on `TemplateOversubscriptionCpu`
//! and `TemplateOversubscriptionMem`
//! (`examples/original_source/schedulerlocal/subset/templateoversubscription.py`).

/// One ratio per vCPU index, repeating the last configured entry when the
/// VM has more vcpus than the template lists (resolves the spec's open
/// question on templates shorter than `vcpus`).
pub fn cpu_vcpu_targets(vcpus: u32, template: &[f64]) -> Vec<f64> {
    (0..vcpus)
        .map(|i| {
            let idx = i as usize;
            if idx < template.len() {
                template[idx]
            } else {
                *template.last().expect("template must be non-empty, enforced at config load")
            }
        })
        .collect()
}

/// Groups per-vCPU targets into `(ratio, vcpu_count)` pairs, preserving
/// first-seen order, so a VM that lands on the same subset id for several
/// vcpus is deployed there once with the summed quantity rather than as
/// duplicate consumer entries.
pub fn group_targets(targets: &[f64]) -> Vec<(f64, u32)> {
    let mut groups: Vec<(f64, u32)> = Vec::new();
    for &t in targets {
        if let Some(existing) = groups.iter_mut().find(|(id, _)| *id == t) {
            existing.1 += 1;
        } else {
            groups.push((t, 1));
        }
    }
    groups
}

/// Memory has no locality and is never split across ratios: a VM always
/// requests one `(1.0, mem_mb)` pair (spec §4.10, "memory is out of scope
/// of locality").
pub fn mem_target(mem_mb: u64) -> (f64, u64) {
    (1.0, mem_mb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeats_last_entry_when_template_shorter_than_vcpus() {
        let targets = cpu_vcpu_targets(4, &[1.0, 3.0]);
        assert_eq!(targets, vec![1.0, 3.0, 3.0, 3.0]);
    }

    #[test]
    fn groups_preserve_first_seen_order() {
        let groups = group_targets(&[3.0, 1.0, 3.0, 3.0]);
        assert_eq!(groups, vec![(3.0, 3), (1.0, 1)]);
    }
}
