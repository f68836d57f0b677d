//! GICv2 Distributor register frame: offsets and field encodings.

use crate::VcpuId;
use bitfield_struct::bitfield;

pub const GICD_CTLR: u32 = 0x000;
pub const GICD_TYPER: u32 = 0x004;
pub const GICD_IIDR: u32 = 0x008;
pub const GICD_IGROUPR0: u32 = 0x080;
pub const GICD_IGROUPR1: u32 = 0x084;
pub const GICD_IGROUPRN: u32 = 0x0FC;
pub const GICD_ISENABLER0: u32 = 0x100;
pub const GICD_ISENABLER1: u32 = 0x104;
pub const GICD_ISENABLERN: u32 = 0x17C;
pub const GICD_ICENABLER0: u32 = 0x180;
pub const GICD_ICENABLER1: u32 = 0x184;
pub const GICD_ICENABLERN: u32 = 0x1FC;
pub const GICD_ISPENDR0: u32 = 0x200;
pub const GICD_ISPENDR1: u32 = 0x204;
pub const GICD_ISPENDRN: u32 = 0x27C;
pub const GICD_ICPENDR0: u32 = 0x280;
pub const GICD_ICPENDR1: u32 = 0x284;
pub const GICD_ICPENDRN: u32 = 0x2FC;
pub const GICD_ISACTIVER0: u32 = 0x300;
pub const GICD_ISACTIVER1: u32 = 0x304;
pub const GICD_ISACTIVERN: u32 = 0x37C;
pub const GICD_ICACTIVER0: u32 = 0x380;
pub const GICD_ICACTIVER1: u32 = 0x384;
pub const GICD_ICACTIVERN: u32 = 0x3FC;
pub const GICD_IPRIORITYR0: u32 = 0x400;
pub const GICD_IPRIORITYR7: u32 = 0x41C;
pub const GICD_IPRIORITYR8: u32 = 0x420;
pub const GICD_IPRIORITYRN: u32 = 0x7F8;
pub const GICD_ITARGETSR0: u32 = 0x800;
pub const GICD_ITARGETSR7: u32 = 0x81C;
pub const GICD_ITARGETSR8: u32 = 0x820;
pub const GICD_ITARGETSRN: u32 = 0xBF8;
pub const GICD_ICFGR0: u32 = 0xC00;
pub const GICD_ICFGRN: u32 = 0xCFC;
pub const GICD_SPISR0: u32 = 0xD00;
pub const GICD_SPISRN: u32 = 0xDE4;
pub const GICD_SGIR: u32 = 0xF00;
pub const GICD_CPENDSGIR0: u32 = 0xF10;
pub const GICD_CPENDSGIRN: u32 = 0xF1C;
pub const GICD_SPENDSGIR0: u32 = 0xF20;
pub const GICD_SPENDSGIRN: u32 = 0xF2C;
pub const GICD_PIDR0: u32 = 0xFC0;
pub const GICD_PIDRN: u32 = 0xFFC;

/// GICD_CTLR bit 0.
pub(crate) const GIC_ENABLED: u32 = 0b1;

/// Word index of `offset` within the register bank starting at `base`.
#[inline]
pub(crate) const fn word_index(offset: u32, base: u32) -> usize {
    ((offset - base) / 4) as usize
}

#[bitfield(u32)]
pub struct GicdTyper {
    #[bits(5)]
    pub it_lines_number: u8,
    #[bits(3)]
    pub cpu_number: u8,
    #[bits(2)]
    _rsvd_9_8: u8,
    pub security_extn: bool,
    #[bits(5)]
    pub lspi: u8,
    #[bits(16)]
    _rsvd_31_16: u16,
}

#[bitfield(u32)]
pub struct GicdSgir {
    #[bits(4)]
    pub sgi_int_id: u8,
    #[bits(11)]
    _rsvd_14_4: u16,
    pub nsatt: bool,
    #[bits(8)]
    pub cpu_target_list: u8,
    #[bits(2)]
    pub target_list_filter: u8,
    #[bits(6)]
    _rsvd_31_26: u8,
}

/// SGIR target list filter modes, bits [25:24].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TargetListFilter {
    /// Forward to the vCPUs named in CPUTargetList.
    TargetListSpecified,
    /// Forward to every vCPU but the requester.
    AllButRequester,
    /// Forward to the requester only.
    RequesterOnly,
}

impl TargetListFilter {
    pub(crate) fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::TargetListSpecified),
            1 => Some(Self::AllButRequester),
            2 => Some(Self::RequesterOnly),
            _ => None,
        }
    }
}

/// Bitmask of vCPUs an SGIR write addresses, one bit per vCPU id.
///
/// The explicit target list is taken as written; delivery loops are bounded
/// by the VM's vCPU count, so stale high bits are harmless.
pub(crate) fn sgir_target_mask(
    vcpu_count: usize,
    requester: VcpuId,
    filter: TargetListFilter,
    cpu_target_list: u8,
) -> u8 {
    let valid = ((1u32 << vcpu_count) - 1) as u8;
    let self_bit = (1u32 << requester.0) as u8;
    match filter {
        TargetListFilter::TargetListSpecified => cpu_target_list,
        TargetListFilter::AllButRequester => valid & !self_bit,
        TargetListFilter::RequesterOnly => self_bit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sgir_fields_decode() {
        let sgir = GicdSgir::from_bits((2 << 24) | (0xAB << 16) | 3);
        assert_eq!(sgir.target_list_filter(), 2);
        assert_eq!(sgir.cpu_target_list(), 0xAB);
        assert_eq!(sgir.sgi_int_id(), 3);
    }

    #[test]
    fn sgir_all_but_self_excludes_requester() {
        let mask = sgir_target_mask(
            3,
            VcpuId(1),
            TargetListFilter::AllButRequester,
            0xFF,
        );
        assert_eq!(mask, 0b101);
    }

    #[test]
    fn sgir_self_only_targets_requester() {
        let mask = sgir_target_mask(8, VcpuId(3), TargetListFilter::RequesterOnly, 0xFF);
        assert_eq!(mask, 0b1000);
    }

    #[test]
    fn sgir_explicit_list_taken_as_written() {
        let mask = sgir_target_mask(
            2,
            VcpuId(0),
            TargetListFilter::TargetListSpecified,
            0b1111,
        );
        assert_eq!(mask, 0b1111);
    }

    #[test]
    fn filter_rejects_reserved_encoding() {
        assert!(TargetListFilter::from_bits(3).is_none());
    }

    #[test]
    fn typer_encoding() {
        let typer = GicdTyper::new()
            .with_it_lines_number(31)
            .with_cpu_number(3);
        assert_eq!(typer.into_bits(), (3 << 5) | 31);
    }
}
