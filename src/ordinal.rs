//! Stable identities: a Unit's position in its set is the integer suffix of
//! its name.

use crate::unit::Unit;
use crate::unitset::UnitSet;
use kube::ResourceExt;

/// Splits `<parent>-<ordinal>`. Names without a numeric suffix have no
/// parent and ordinal -1.
pub fn parent_and_ordinal(name: &str) -> (&str, i32) {
    match name.rsplit_once('-') {
        Some((parent, digits))
            if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) =>
        {
            match digits.parse::<i32>() {
                Ok(ordinal) => (parent, ordinal),
                Err(_) => ("", -1),
            }
        }
        _ => ("", -1),
    }
}

pub fn ordinal_of(unit: &Unit) -> i32 {
    parent_and_ordinal(unit.metadata.name.as_deref().unwrap_or("")).1
}

pub fn unit_name(set: &UnitSet, ordinal: i32) -> String {
    format!("{}-{}", set.name_any(), ordinal)
}

/// First ordinal of the window, inclusive.
pub fn start_ordinal(set: &UnitSet) -> i32 {
    set.spec.ordinals.as_ref().map_or(0, |o| o.start)
}

/// Last ordinal of the window, inclusive. Below the start when replicas is 0.
pub fn end_ordinal(set: &UnitSet) -> i32 {
    start_ordinal(set) + set.spec.replicas - 1
}

pub fn in_window(unit: &Unit, set: &UnitSet) -> bool {
    let ordinal = ordinal_of(unit);
    ordinal >= start_ordinal(set) && ordinal <= end_ordinal(set)
}

/// Units split by where their ordinal falls.
#[derive(Debug, Default)]
pub struct Partitioned {
    /// One entry per ordinal in the window, `None` where no Unit exists yet.
    pub slots: Vec<Option<Unit>>,
    /// Units above or below the window, highest ordinal first.
    pub condemned: Vec<Unit>,
}

/// Places every Unit with a valid ordinal either in its slot or among the
/// condemned. Units without an ordinal are left alone entirely.
pub fn partition_units(set: &UnitSet, units: Vec<Unit>) -> Partitioned {
    let start = start_ordinal(set);
    let mut slots: Vec<Option<Unit>> = vec![None; set.spec.replicas.max(0) as usize];
    let mut condemned = Vec::with_capacity(units.len());
    for unit in units {
        let ordinal = ordinal_of(&unit);
        if in_window(&unit, set) {
            slots[(ordinal - start) as usize] = Some(unit);
        } else if ordinal >= 0 {
            condemned.push(unit);
        }
    }
    condemned.sort_by_key(|u| std::cmp::Reverse(ordinal_of(u)));
    Partitioned { slots, condemned }
}
