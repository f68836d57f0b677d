//! MMIO fault dispatcher for the Distributor frame.
//!
//! Reads come masked from the shadow image; writes either route through
//! the per-IRQ semantic operations (enable/pending banks, one bit at a
//! time) or merge into the shadow word under the fault's byte-lane mask.
//! Either way the guest resumes: unknown or read-only locations are
//! logged and dropped rather than faulting the VM.

use crate::GicError;
use crate::NUM_VIRQ_IDS;
use crate::VIntId;
use crate::VcpuId;
use crate::fault::DistFault;
use crate::fault::FaultResult;
use crate::registers::GICD_CPENDSGIR0;
use crate::registers::GICD_CPENDSGIRN;
use crate::registers::GICD_CTLR;
use crate::registers::GICD_ICACTIVER0;
use crate::registers::GICD_ICACTIVER1;
use crate::registers::GICD_ICACTIVERN;
use crate::registers::GICD_ICENABLER0;
use crate::registers::GICD_ICENABLER1;
use crate::registers::GICD_ICENABLERN;
use crate::registers::GICD_ICFGR0;
use crate::registers::GICD_ICFGRN;
use crate::registers::GICD_ICPENDR0;
use crate::registers::GICD_ICPENDR1;
use crate::registers::GICD_ICPENDRN;
use crate::registers::GICD_IGROUPR0;
use crate::registers::GICD_IGROUPR1;
use crate::registers::GICD_IGROUPRN;
use crate::registers::GICD_IIDR;
use crate::registers::GICD_IPRIORITYR0;
use crate::registers::GICD_IPRIORITYR7;
use crate::registers::GICD_IPRIORITYR8;
use crate::registers::GICD_IPRIORITYRN;
use crate::registers::GICD_ISACTIVER0;
use crate::registers::GICD_ISACTIVER1;
use crate::registers::GICD_ISACTIVERN;
use crate::registers::GICD_ISENABLER0;
use crate::registers::GICD_ISENABLER1;
use crate::registers::GICD_ISENABLERN;
use crate::registers::GICD_ISPENDR0;
use crate::registers::GICD_ISPENDR1;
use crate::registers::GICD_ISPENDRN;
use crate::registers::GICD_ITARGETSR0;
use crate::registers::GICD_ITARGETSR7;
use crate::registers::GICD_ITARGETSR8;
use crate::registers::GICD_ITARGETSRN;
use crate::registers::GICD_PIDR0;
use crate::registers::GICD_PIDRN;
use crate::registers::GICD_SGIR;
use crate::registers::GICD_SPENDSGIR0;
use crate::registers::GICD_SPENDSGIRN;
use crate::registers::GICD_SPISR0;
use crate::registers::GICD_SPISRN;
use crate::registers::GICD_TYPER;
use crate::registers::GIC_ENABLED;
use crate::registers::word_index;
use crate::vgic::Vgic;
use crate::vgic::VgicHw;

impl<const VCPUS: usize> Vgic<VCPUS> {
    /// Emulate one trapped Distributor access for `vcpu`.
    pub fn handle_dist_fault<H: VgicHw>(
        &mut self,
        hw: &mut H,
        vcpu: VcpuId,
        fault: &mut DistFault,
    ) -> FaultResult {
        let res = if fault.is_read() {
            self.handle_dist_read(vcpu, fault)
        } else {
            self.handle_dist_write(hw, vcpu, fault)
        };
        match res {
            Ok(()) => FaultResult::Handled,
            Err(err) => {
                log::error!("distributor fault emulation failed: {}", err);
                FaultResult::Error
            }
        }
    }

    fn handle_dist_read(&mut self, vcpu: VcpuId, fault: &mut DistFault) -> Result<(), GicError> {
        let idx = self.dist.vcpu_index(vcpu)?;
        let offset = fault.offset() & !0x3;
        let reg = match offset {
            GICD_CTLR => self.dist.ctlr(),
            GICD_TYPER => self.dist.typer(),
            GICD_IIDR => self.dist.iidr(),
            // Reserved and implementation-defined windows read as zero.
            0x00C..=0x01C | 0x020..=0x03C | 0x040..=0x07C => 0,
            GICD_IGROUPR0 => self.dist.irq_group0[idx],
            GICD_IGROUPR1..=GICD_IGROUPRN => {
                self.dist.irq_group[word_index(offset, GICD_IGROUPR0)]
            }
            GICD_ISENABLER0 => self.dist.enable_set0[idx],
            GICD_ISENABLER1..=GICD_ISENABLERN => {
                self.dist.enable_set[word_index(offset, GICD_ISENABLER0)]
            }
            GICD_ICENABLER0 => self.dist.enable_clr0[idx],
            GICD_ICENABLER1..=GICD_ICENABLERN => {
                self.dist.enable_clr[word_index(offset, GICD_ICENABLER0)]
            }
            GICD_ISPENDR0 => self.dist.pending_set0[idx],
            GICD_ISPENDR1..=GICD_ISPENDRN => {
                self.dist.pending_set[word_index(offset, GICD_ISPENDR0)]
            }
            GICD_ICPENDR0 => self.dist.pending_clr0[idx],
            GICD_ICPENDR1..=GICD_ICPENDRN => {
                self.dist.pending_clr[word_index(offset, GICD_ICPENDR0)]
            }
            GICD_ISACTIVER0 => self.dist.active0[idx],
            GICD_ISACTIVER1..=GICD_ISACTIVERN => {
                self.dist.active[word_index(offset, GICD_ISACTIVER0)]
            }
            GICD_ICACTIVER0 => self.dist.active_clr0[idx],
            GICD_ICACTIVER1..=GICD_ICACTIVERN => {
                self.dist.active_clr[word_index(offset, GICD_ICACTIVER0)]
            }
            GICD_IPRIORITYR0..=GICD_IPRIORITYR7 => {
                self.dist.priority0[idx][word_index(offset, GICD_IPRIORITYR0)]
            }
            GICD_IPRIORITYR8..=GICD_IPRIORITYRN => {
                self.dist.priority[word_index(offset, GICD_IPRIORITYR0)]
            }
            0x7FC => 0,
            GICD_ITARGETSR0..=GICD_ITARGETSR7 => {
                self.dist.targets0[idx][word_index(offset, GICD_ITARGETSR0)]
            }
            GICD_ITARGETSR8..=GICD_ITARGETSRN => {
                self.dist.targets[word_index(offset, GICD_ITARGETSR0)]
            }
            0xBFC => 0,
            GICD_ICFGR0..=GICD_ICFGRN => self.dist.config[word_index(offset, GICD_ICFGR0)],
            GICD_SPISR0..=GICD_SPISRN => self.dist.spi_status[word_index(offset, GICD_SPISR0)],
            // Reserved, then GICD_NSACR (unsupported).
            0xDE8..=0xEFC => 0,
            GICD_SGIR => self.dist.sgi_control,
            0xF04..=0xF0C => 0,
            GICD_CPENDSGIR0..=GICD_CPENDSGIRN => {
                self.dist.sgi_pending_clr[idx][word_index(offset, GICD_CPENDSGIR0)]
            }
            GICD_SPENDSGIR0..=GICD_SPENDSGIRN => {
                self.dist.sgi_pending_set[idx][word_index(offset, GICD_SPENDSGIR0)]
            }
            0xF30..=0xFBC => 0,
            GICD_PIDR0..=GICD_PIDRN => self.dist.periph_id[word_index(offset, GICD_PIDR0)],
            _ => {
                log::error!("unknown register offset {:#x}", offset);
                fault.ignore();
                return Ok(());
            }
        };
        fault.set_data(reg & fault.data_mask());
        fault.advance();
        Ok(())
    }

    fn handle_dist_write<H: VgicHw>(
        &mut self,
        hw: &mut H,
        vcpu: VcpuId,
        fault: &mut DistFault,
    ) -> Result<(), GicError> {
        let idx = self.dist.vcpu_index(vcpu)?;
        let offset = fault.offset() & !0x3;
        match offset {
            GICD_CTLR => {
                let data = fault.data();
                if data == GIC_ENABLED {
                    log::debug!("enabling gic distributor");
                    self.dist.enable_dist();
                } else if data == 0 {
                    log::debug!("disabling gic distributor");
                    self.dist.disable_dist();
                } else {
                    log::error!("unknown distributor enable encoding {:#x}", data);
                }
            }
            // Read-only identification.
            GICD_TYPER | GICD_IIDR => {}
            0x00C..=0x01C | 0x020..=0x03C | 0x040..=0x07C => {}
            GICD_IGROUPR0 => {
                self.dist.irq_group0[idx] = fault.emulate(self.dist.irq_group0[idx]);
            }
            GICD_IGROUPR1..=GICD_IGROUPRN => {
                let w = word_index(offset, GICD_IGROUPR0);
                self.dist.irq_group[w] = fault.emulate(self.dist.irq_group[w]);
            }
            GICD_ISENABLER0..=GICD_ISENABLERN => {
                self.for_each_written_irq(fault, GICD_ISENABLER0, |vgic, virq| {
                    vgic.enable_irq(vcpu, virq)
                })?;
            }
            GICD_ICENABLER0..=GICD_ICENABLERN => {
                self.for_each_written_irq(fault, GICD_ICENABLER0, |vgic, virq| {
                    vgic.disable_irq(vcpu, virq)
                })?;
            }
            GICD_ISPENDR0..=GICD_ISPENDRN => {
                self.for_each_written_irq(fault, GICD_ISPENDR0, |vgic, virq| {
                    // Undeliverable set-pending writes are dropped.
                    match vgic.set_pending_irq(hw, vcpu, virq) {
                        Ok(()) | Err(GicError::NotDeliverable) => Ok(()),
                        Err(err) => Err(err),
                    }
                })?;
            }
            GICD_ICPENDR0..=GICD_ICPENDRN => {
                self.for_each_written_irq(fault, GICD_ICPENDR0, |vgic, virq| {
                    vgic.clr_pending_irq(vcpu, virq)
                })?;
            }
            GICD_ISACTIVER0 => {
                let next = fault.emulate(self.dist.active0[idx]);
                self.dist.active0[idx] = next;
                self.dist.active_clr0[idx] = next;
            }
            GICD_ISACTIVER1..=GICD_ISACTIVERN => {
                let w = word_index(offset, GICD_ISACTIVER0);
                let next = fault.emulate(self.dist.active[w]);
                self.dist.active[w] = next;
                self.dist.active_clr[w] = next;
            }
            GICD_ICACTIVER0 => {
                let next = fault.emulate(self.dist.active_clr0[idx]);
                self.dist.active0[idx] = next;
                self.dist.active_clr0[idx] = next;
            }
            GICD_ICACTIVER1..=GICD_ICACTIVERN => {
                let w = word_index(offset, GICD_ICACTIVER0);
                let next = fault.emulate(self.dist.active_clr[w]);
                self.dist.active[w] = next;
                self.dist.active_clr[w] = next;
            }
            // Priority, target and configuration writes are not emulated.
            GICD_IPRIORITYR0..=GICD_IPRIORITYRN => {}
            0x7FC => {}
            GICD_ITARGETSR0..=GICD_ITARGETSRN => {}
            0xBFC => {}
            GICD_ICFGR0..=GICD_ICFGRN => {}
            GICD_SPISR0..=GICD_SPISRN => {}
            0xDE8..=0xEFC => {}
            GICD_SGIR => {
                let data = fault.data();
                self.dist.sgi_control = data;
                self.dispatch_sgi(hw, vcpu, data)?;
            }
            0xF04..=0xF0C => {}
            GICD_CPENDSGIR0..=GICD_SPENDSGIRN => {
                log::error!("SGI pending registers not implemented; write ignored");
            }
            0xF30..=0xFBC => {}
            GICD_PIDR0..=GICD_PIDRN => {}
            _ => log::error!("unknown register offset {:#x}", offset),
        }
        fault.ignore();
        Ok(())
    }

    /// Run `op` for every IRQ whose bit is set in the faulting write.
    /// `base` is the offset of the bank's first word, so
    /// `irq = bit + (offset - base) * 8`.
    fn for_each_written_irq(
        &mut self,
        fault: &DistFault,
        base: u32,
        mut op: impl FnMut(&mut Self, VIntId) -> Result<(), GicError>,
    ) -> Result<(), GicError> {
        let offset = fault.offset() & !0x3;
        let mut data = fault.data() & fault.data_mask();
        while data != 0 {
            let bit = data.trailing_zeros();
            data &= !(1u32 << bit);
            let virq = bit + (offset - base) * 8;
            if virq as usize >= NUM_VIRQ_IDS {
                continue;
            }
            op(self, VIntId(virq))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virq::VirqHandler;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    struct FakeHw {
        online: [bool; 8],
        loads: Vec<(VcpuId, usize, VIntId)>,
    }

    impl FakeHw {
        fn new() -> Self {
            Self {
                online: [true; 8],
                loads: Vec::new(),
            }
        }
    }

    impl VgicHw for FakeHw {
        fn is_vcpu_online(&self, vcpu: VcpuId) -> bool {
            self.online[vcpu.0 as usize]
        }

        fn load_list_reg(
            &mut self,
            vcpu: VcpuId,
            lr: usize,
            irq: &VirqHandler,
        ) -> Result<(), GicError> {
            self.loads.push((vcpu, lr, irq.virq()));
            Ok(())
        }
    }

    fn nop_ack(_vcpu: VcpuId, _virq: VIntId, _token: usize) {}

    fn write<const N: usize>(
        vgic: &mut Vgic<N>,
        hw: &mut FakeHw,
        vcpu: VcpuId,
        offset: u32,
        data: u32,
    ) {
        let mut fault = DistFault::write(offset, data, 0xFFFF_FFFF);
        let res = vgic.handle_dist_fault(hw, vcpu, &mut fault);
        assert_eq!(res, FaultResult::Handled);
        assert!(fault.is_resolved());
    }

    fn read<const N: usize>(vgic: &mut Vgic<N>, hw: &mut FakeHw, vcpu: VcpuId, offset: u32) -> u32 {
        let mut fault = DistFault::read(offset, 0xFFFF_FFFF);
        let res = vgic.handle_dist_fault(hw, vcpu, &mut fault);
        assert_eq!(res, FaultResult::Handled);
        fault.data()
    }

    #[test]
    fn ctlr_write_and_read_roundtrip() {
        let mut vgic: Vgic<1> = Vgic::new(1).unwrap();
        let mut hw = FakeHw::new();
        assert_eq!(read(&mut vgic, &mut hw, VcpuId(0), 0x000), 0);
        write(&mut vgic, &mut hw, VcpuId(0), 0x000, 1);
        assert_eq!(read(&mut vgic, &mut hw, VcpuId(0), 0x000), 1);
        write(&mut vgic, &mut hw, VcpuId(0), 0x000, 0);
        assert_eq!(read(&mut vgic, &mut hw, VcpuId(0), 0x000), 0);
    }

    #[test]
    fn spi_delivery_end_to_end() {
        let mut vgic: Vgic<1> = Vgic::new(1).unwrap();
        let mut hw = FakeHw::new();
        vgic.register_irq(VcpuId(0), VIntId(42), nop_ack, 0).unwrap();
        write(&mut vgic, &mut hw, VcpuId(0), 0x000, 1);
        write(&mut vgic, &mut hw, VcpuId(0), 0x104, 1 << (42 % 32));
        write(&mut vgic, &mut hw, VcpuId(0), 0x204, 1 << (42 % 32));
        assert_eq!(hw.loads, vec![(VcpuId(0), 0, VIntId(42))]);
        assert_eq!(
            read(&mut vgic, &mut hw, VcpuId(0), 0x204) & (1 << (42 % 32)),
            1 << (42 % 32)
        );
    }

    #[test]
    fn enable_write_reads_back_with_prior_bits() {
        let mut vgic: Vgic<1> = Vgic::new(1).unwrap();
        let mut hw = FakeHw::new();
        write(&mut vgic, &mut hw, VcpuId(0), 0x104, 0b0101);
        write(&mut vgic, &mut hw, VcpuId(0), 0x104, 0b1100);
        assert_eq!(read(&mut vgic, &mut hw, VcpuId(0), 0x104), 0b1101);
        assert_eq!(read(&mut vgic, &mut hw, VcpuId(0), 0x184), 0b1101);
    }

    #[test]
    fn disable_write_clears_enable_bits() {
        let mut vgic: Vgic<1> = Vgic::new(1).unwrap();
        let mut hw = FakeHw::new();
        write(&mut vgic, &mut hw, VcpuId(0), 0x104, 0b1111);
        write(&mut vgic, &mut hw, VcpuId(0), 0x184, 0b0110);
        assert_eq!(read(&mut vgic, &mut hw, VcpuId(0), 0x104), 0b1001);
    }

    #[test]
    fn sgi_disable_is_ignored() {
        let mut vgic: Vgic<1> = Vgic::new(1).unwrap();
        let mut hw = FakeHw::new();
        // SGIs come up enabled; a clear-enable write must not stick.
        assert_eq!(read(&mut vgic, &mut hw, VcpuId(0), 0x100), 0xFFFF);
        write(&mut vgic, &mut hw, VcpuId(0), 0x180, 0xFFFF);
        assert_eq!(read(&mut vgic, &mut hw, VcpuId(0), 0x100), 0xFFFF);
    }

    #[test]
    fn ppi_disable_does_stick() {
        let mut vgic: Vgic<1> = Vgic::new(1).unwrap();
        let mut hw = FakeHw::new();
        write(&mut vgic, &mut hw, VcpuId(0), 0x100, 1 << 17);
        write(&mut vgic, &mut hw, VcpuId(0), 0x180, 1 << 17);
        assert_eq!(read(&mut vgic, &mut hw, VcpuId(0), 0x100) & (1 << 17), 0);
    }

    #[test]
    fn priority_writes_are_ignored() {
        let mut vgic: Vgic<1> = Vgic::new(1).unwrap();
        let mut hw = FakeHw::new();
        let before = read(&mut vgic, &mut hw, VcpuId(0), 0x420);
        write(&mut vgic, &mut hw, VcpuId(0), 0x420, 0xA0A0_A0A0);
        assert_eq!(read(&mut vgic, &mut hw, VcpuId(0), 0x420), before);
    }

    #[test]
    fn active_banks_stay_paired_through_emulated_writes() {
        let mut vgic: Vgic<1> = Vgic::new(1).unwrap();
        let mut hw = FakeHw::new();
        write(&mut vgic, &mut hw, VcpuId(0), 0x304, 0b1010);
        assert_eq!(read(&mut vgic, &mut hw, VcpuId(0), 0x304), 0b1010);
        assert_eq!(read(&mut vgic, &mut hw, VcpuId(0), 0x384), 0b1010);
        assert!(vgic.is_irq_active(VcpuId(0), VIntId(33)).unwrap());
        write(&mut vgic, &mut hw, VcpuId(0), 0x384, 0b0010);
        assert_eq!(read(&mut vgic, &mut hw, VcpuId(0), 0x304), 0b0010);
        assert_eq!(read(&mut vgic, &mut hw, VcpuId(0), 0x384), 0b0010);
    }

    #[test]
    fn enable_of_quiescent_irq_acks_handler() {
        static ACKS: AtomicUsize = AtomicUsize::new(0);
        static LAST: AtomicUsize = AtomicUsize::new(0);
        fn recording_ack(vcpu: VcpuId, virq: VIntId, token: usize) {
            ACKS.fetch_add(1, Ordering::Relaxed);
            LAST.store(
                (vcpu.0 as usize) << 32 | (virq.0 as usize) << 16 | token,
                Ordering::Relaxed,
            );
        }

        let mut vgic: Vgic<1> = Vgic::new(1).unwrap();
        let mut hw = FakeHw::new();
        vgic.register_irq(VcpuId(0), VIntId(50), recording_ack, 9)
            .unwrap();
        write(&mut vgic, &mut hw, VcpuId(0), 0x104, 1 << (50 % 32));
        assert_eq!(ACKS.load(Ordering::Relaxed), 1);
        assert_eq!(LAST.load(Ordering::Relaxed), (50 << 16) | 9);
    }

    #[test]
    fn sgir_self_targets_requester_only() {
        let mut vgic: Vgic<2> = Vgic::new(2).unwrap();
        let mut hw = FakeHw::new();
        for vcpu in 0..2 {
            vgic.register_irq(VcpuId(vcpu), VIntId(3), nop_ack, 0)
                .unwrap();
        }
        write(&mut vgic, &mut hw, VcpuId(0), 0x000, 1);
        write(&mut vgic, &mut hw, VcpuId(1), 0xF00, (2 << 24) | 3);
        assert_eq!(hw.loads, vec![(VcpuId(1), 0, VIntId(3))]);
        assert!(!vgic.is_irq_pending(VcpuId(0), VIntId(3)).unwrap());
        assert!(vgic.is_irq_pending(VcpuId(1), VIntId(3)).unwrap());
    }

    #[test]
    fn sgir_others_skips_requester_and_offline() {
        let mut vgic: Vgic<4> = Vgic::new(4).unwrap();
        let mut hw = FakeHw::new();
        hw.online[2] = false;
        for vcpu in 0..4 {
            vgic.register_irq(VcpuId(vcpu), VIntId(5), nop_ack, 0)
                .unwrap();
        }
        write(&mut vgic, &mut hw, VcpuId(0), 0x000, 1);
        write(&mut vgic, &mut hw, VcpuId(0), 0xF00, (1 << 24) | 5);
        let targets: Vec<u16> = hw.loads.iter().map(|(v, _, _)| v.0).collect();
        assert_eq!(targets, vec![1, 3]);
    }

    #[test]
    fn sgir_read_returns_last_written_value() {
        let mut vgic: Vgic<2> = Vgic::new(2).unwrap();
        let mut hw = FakeHw::new();
        let value = (2 << 24) | 7;
        write(&mut vgic, &mut hw, VcpuId(0), 0xF00, value);
        assert_eq!(read(&mut vgic, &mut hw, VcpuId(0), 0xF00), value);
    }

    #[test]
    fn nsacr_write_is_ignored() {
        let mut vgic: Vgic<1> = Vgic::new(1).unwrap();
        let mut hw = FakeHw::new();
        write(&mut vgic, &mut hw, VcpuId(0), 0xE00, 0x1234_5678);
        assert_eq!(read(&mut vgic, &mut hw, VcpuId(0), 0xE00), 0);
        // Neighbouring state is untouched.
        assert_eq!(read(&mut vgic, &mut hw, VcpuId(0), 0x000), 0);
    }

    #[test]
    fn sgi_pending_write_is_rejected_quietly() {
        let mut vgic: Vgic<1> = Vgic::new(1).unwrap();
        let mut hw = FakeHw::new();
        write(&mut vgic, &mut hw, VcpuId(0), 0xF20, 0xFFFF_FFFF);
        assert_eq!(read(&mut vgic, &mut hw, VcpuId(0), 0xF20), 0);
    }

    #[test]
    fn reads_honour_byte_lane_mask() {
        let mut vgic: Vgic<1> = Vgic::new(1).unwrap();
        let mut hw = FakeHw::new();
        let mut fault = DistFault::read(0x100, 0x0000_00FF);
        let res = vgic.handle_dist_fault(&mut hw, VcpuId(0), &mut fault);
        assert_eq!(res, FaultResult::Handled);
        assert_eq!(fault.data(), 0xFF);
    }

    #[test]
    fn identification_window_reads() {
        let mut vgic: Vgic<1> = Vgic::new(1).unwrap();
        let mut hw = FakeHw::new();
        assert_eq!(read(&mut vgic, &mut hw, VcpuId(0), 0x008), 0x0200_043B);
        assert_eq!(read(&mut vgic, &mut hw, VcpuId(0), 0xFF0), 0x0D);
        // TYPER geometry for a single-vCPU VM.
        let typer = read(&mut vgic, &mut hw, VcpuId(0), 0x004);
        assert_eq!(typer & 0x1F, 31);
        assert_eq!((typer >> 5) & 0x7, 0);
    }

    #[test]
    fn fault_from_unknown_vcpu_is_an_error() {
        let mut vgic: Vgic<1> = Vgic::new(1).unwrap();
        let mut hw = FakeHw::new();
        let mut fault = DistFault::read(0x000, 0xFFFF_FFFF);
        let res = vgic.handle_dist_fault(&mut hw, VcpuId(3), &mut fault);
        assert_eq!(res, FaultResult::Error);
    }
}
