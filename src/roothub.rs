//! Root-hub port model: PORTSC ⇄ abstract port-status/feature vocabulary
//! (§4.G).

use crate::bus::Bus;
use crate::error::UsbError;
use crate::regs::{self, RegisterWindow, PORTSC};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PortStatus: u16 {
        const CONNECTION   = 1 << 0;
        const ENABLE       = 1 << 1;
        const SUSPEND      = 1 << 2;
        const OVER_CURRENT = 1 << 3;
        const RESET        = 1 << 4;
        const POWER        = 1 << 8;
        const LOW_SPEED    = 1 << 9;
        const HIGH_SPEED   = 1 << 10;
        const OWNER        = 1 << 13;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PortChangeStatus: u16 {
        const CONNECTION   = 1 << 0;
        const ENABLE       = 1 << 1;
        const OVER_CURRENT = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortFeature {
    Enable,
    Suspend,
    Reset,
    Power,
    Owner,
    ConnectChange,
    EnableChange,
    OverCurrentChange,
}

/// Reads PORTSC for `port_index` and translates it into the abstract
/// status/change vocabulary (§4.G state/change bit tables). Speed
/// disambiguation: K-state line status means low-speed; otherwise Enable
/// set means high-speed (full-speed is inferred by the caller after reset
/// handoff, per the distilled spec).
pub fn get_port_status<B: Bus>(
    regs: &RegisterWindow<B>,
    port_index: usize,
) -> Result<(PortStatus, PortChangeStatus), UsbError> {
    if port_index as u32 >= regs.port_count() {
        return Err(UsbError::InvalidParameter);
    }
    let raw = regs.portsc(port_index);
    let local = crate::regs::local_reg::<PORTSC::Register>(raw);

    let mut status = PortStatus::empty();
    if local.is_set(PORTSC::CCS) {
        status |= PortStatus::CONNECTION;
    }
    if local.is_set(PORTSC::PE) {
        status |= PortStatus::ENABLE;
    }
    if local.is_set(PORTSC::SUSPEND) {
        status |= PortStatus::SUSPEND;
    }
    if local.is_set(PORTSC::OCA) {
        status |= PortStatus::OVER_CURRENT;
    }
    if local.is_set(PORTSC::PR) {
        status |= PortStatus::RESET;
    }
    if local.is_set(PORTSC::PP) {
        status |= PortStatus::POWER;
    }
    if local.is_set(PORTSC::PO) {
        status |= PortStatus::OWNER;
    }

    const LINE_STATUS_K_STATE: u32 = 1;
    if local.read(PORTSC::LS) == LINE_STATUS_K_STATE {
        status |= PortStatus::LOW_SPEED;
    } else if local.is_set(PORTSC::PE) {
        status |= PortStatus::HIGH_SPEED;
    }

    let mut change = PortChangeStatus::empty();
    if local.is_set(PORTSC::CSC) {
        change |= PortChangeStatus::CONNECTION;
    }
    if local.is_set(PORTSC::PEC) {
        change |= PortChangeStatus::ENABLE;
    }
    if local.is_set(PORTSC::OCC) {
        change |= PortChangeStatus::OVER_CURRENT;
    }

    Ok((status, change))
}

/// Sets a port feature. Masks off every write-1-to-clear change bit before
/// writing back so the set cannot unintentionally clear an unrelated
/// pending change (§4.G). `Reset` additionally clears `Enable` per the EHCI
/// spec's reset handoff rule.
pub fn set_feature<B: Bus>(
    regs: &RegisterWindow<B>,
    port_index: usize,
    feature: PortFeature,
) -> Result<(), UsbError> {
    if port_index as u32 >= regs.port_count() {
        return Err(UsbError::InvalidParameter);
    }
    let raw = regs.portsc(port_index);
    let mut local = crate::regs::local_reg::<PORTSC::Register>(raw);

    match feature {
        PortFeature::Enable => local.modify(PORTSC::PE::SET),
        PortFeature::Suspend => local.modify(PORTSC::SUSPEND::SET),
        PortFeature::Reset => {
            local.modify(PORTSC::PR::SET);
            local.modify(PORTSC::PE::CLEAR);
        }
        PortFeature::Power => local.modify(PORTSC::PP::SET),
        PortFeature::Owner => local.modify(PORTSC::PO::SET),
        PortFeature::ConnectChange | PortFeature::EnableChange | PortFeature::OverCurrentChange => {
            return Err(UsbError::InvalidParameter);
        }
    }

    regs.write_portsc_preserving_changes(port_index, local.get());
    Ok(())
}

/// Clears a port feature (Enable, Suspend, Reset, Power, Owner, or one of
/// the three change bits). Suspend-Change and Reset-Change clears are
/// no-ops per §4.G (EHCI has no such change bits); clearing `Owner` returns
/// the port to this controller.
pub fn clear_feature<B: Bus>(
    regs: &RegisterWindow<B>,
    port_index: usize,
    feature: PortFeature,
) -> Result<(), UsbError> {
    if port_index as u32 >= regs.port_count() {
        return Err(UsbError::InvalidParameter);
    }
    let raw = regs.portsc(port_index);
    let mut local = crate::regs::local_reg::<PORTSC::Register>(raw);

    match feature {
        PortFeature::Enable => local.modify(PORTSC::PE::CLEAR),
        PortFeature::Suspend => local.modify(PORTSC::SUSPEND::CLEAR),
        PortFeature::Reset => local.modify(PORTSC::PR::CLEAR),
        PortFeature::Power => local.modify(PORTSC::PP::CLEAR),
        PortFeature::Owner => local.modify(PORTSC::PO::CLEAR),
        PortFeature::ConnectChange => {
            regs.write_portsc_raw(
                port_index,
                (raw & !regs::PORTSC_WC_MASK) | (1 << PORTSC::CSC.shift),
            );
            return Ok(());
        }
        PortFeature::EnableChange => {
            regs.write_portsc_raw(
                port_index,
                (raw & !regs::PORTSC_WC_MASK) | (1 << PORTSC::PEC.shift),
            );
            return Ok(());
        }
        PortFeature::OverCurrentChange => {
            regs.write_portsc_raw(
                port_index,
                (raw & !regs::PORTSC_WC_MASK) | (1 << PORTSC::OCC.shift),
            );
            return Ok(());
        }
    }

    regs.write_portsc_preserving_changes(port_index, local.get());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_bit_mask_covers_exactly_three_bits() {
        assert_eq!(
            regs::PORTSC_WC_MASK,
            (1 << PORTSC::CSC.shift) | (1 << PORTSC::PEC.shift) | (1 << PORTSC::OCC.shift)
        );
    }
}
