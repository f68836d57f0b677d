//! The vGIC aggregate: Distributor shadow, handler table and per-vCPU
//! injection pipelines, plus the injection API exposed to IRQ sources.

use crate::AckFn;
use crate::GicError;
use crate::NUM_LIST_REGS;
use crate::NUM_SGI_VIRQS;
use crate::NUM_VIRQ_IDS;
use crate::VIntId;
use crate::VcpuId;
use crate::dist::DistState;
use crate::registers::GicdSgir;
use crate::registers::TargetListFilter;
use crate::registers::sgir_target_mask;
use crate::virq::VcpuInject;
use crate::virq::VirqHandler;
use crate::virq::VirqTable;

/// Services the core consumes from the surrounding VMM: vCPU power state
/// and the hypercall that programs a physical list register.
pub trait VgicHw {
    /// True when the VM control layer has brought `vcpu` online.
    fn is_vcpu_online(&self, vcpu: VcpuId) -> bool;

    /// Program hardware list register `lr` of `vcpu` with `irq`. On
    /// success the core records the assignment in its shadow.
    fn load_list_reg(
        &mut self,
        vcpu: VcpuId,
        lr: usize,
        irq: &VirqHandler,
    ) -> Result<(), GicError>;
}

/// Virtual GICv2 Distributor for one VM.
///
/// `VCPUS` bounds the banked state; the live vCPU count is chosen at
/// construction and may be smaller. Callers serialize entry: every
/// operation runs to completion on the VMM thread while the affected vCPU
/// is halted in a fault.
pub struct Vgic<const VCPUS: usize> {
    pub(crate) dist: DistState<VCPUS>,
    handlers: VirqTable<VCPUS>,
    inject: [VcpuInject; VCPUS],
}

impl<const VCPUS: usize> Vgic<VCPUS> {
    pub fn new(vcpu_count: usize) -> Result<Self, GicError> {
        Ok(Self {
            dist: DistState::new(vcpu_count)?,
            handlers: VirqTable::new(),
            inject: core::array::from_fn(|_| VcpuInject::new()),
        })
    }

    pub fn vcpu_count(&self) -> usize {
        self.dist.vcpu_count()
    }

    /// True when the guest has enabled the distributor through GICD_CTLR.
    pub fn dist_enabled(&self) -> bool {
        self.dist.dist_enabled()
    }

    pub fn is_irq_enabled(&self, vcpu: VcpuId, virq: VIntId) -> Result<bool, GicError> {
        self.dist.is_enabled(virq, vcpu)
    }

    pub fn is_irq_pending(&self, vcpu: VcpuId, virq: VIntId) -> Result<bool, GicError> {
        self.dist.is_pending(virq, vcpu)
    }

    pub fn is_irq_active(&self, vcpu: VcpuId, virq: VIntId) -> Result<bool, GicError> {
        self.dist.is_active(virq, vcpu)
    }

    /// Register a handler for `virq`. SGI/PPI handlers are banked per
    /// vCPU; an SPI handler owns the id VM-wide.
    pub fn register_irq(
        &mut self,
        vcpu: VcpuId,
        virq: VIntId,
        ack: AckFn,
        token: usize,
    ) -> Result<(), GicError> {
        if virq.0 as usize >= NUM_VIRQ_IDS {
            return Err(GicError::UnsupportedIntId);
        }
        let idx = self.dist.vcpu_index(vcpu)?;
        self.handlers.register(idx, VirqHandler::new(virq, ack, token))
    }

    /// Deliver `virq` to `vcpu` on behalf of an external IRQ source.
    ///
    /// `Ok` covers both the loaded-or-queued case and the already-pending
    /// no-op; `NotDeliverable` means no handler is registered, the
    /// distributor is off, or the IRQ is disabled on this vCPU.
    pub fn inject_irq<H: VgicHw>(
        &mut self,
        hw: &mut H,
        vcpu: VcpuId,
        virq: VIntId,
    ) -> Result<(), GicError> {
        self.set_pending_irq(hw, vcpu, virq)
    }

    /// Maintenance hook: hardware retired list register `lr` of `vcpu`.
    ///
    /// Clears the shadow slot and the retired IRQ's pending bit, acks its
    /// handler so the source may re-raise, then promotes the next queued
    /// IRQ into the freed register.
    pub fn on_lr_freed<H: VgicHw>(
        &mut self,
        hw: &mut H,
        vcpu: VcpuId,
        lr: usize,
    ) -> Result<(), GicError> {
        let idx = self.dist.vcpu_index(vcpu)?;
        if lr >= NUM_LIST_REGS {
            return Err(GicError::InvalidState);
        }
        if let Some(retired) = self.inject[idx].clear_lr(lr) {
            self.dist.set_pending(retired.virq(), false, vcpu)?;
            retired.ack(vcpu);
        }
        let Some(next) = self.inject[idx].queue.dequeue() else {
            return Ok(());
        };
        hw.load_list_reg(vcpu, lr, &next)?;
        self.inject[idx].shadow_lr(lr, next);
        Ok(())
    }

    pub(crate) fn enable_irq(&mut self, vcpu: VcpuId, virq: VIntId) -> Result<(), GicError> {
        let idx = self.dist.vcpu_index(vcpu)?;
        log::debug!("enabling irq {}", virq.0);
        self.dist.set_enable(virq, true, vcpu)?;
        match self.handlers.find(idx, virq) {
            Some(handler) => {
                // Enabling a quiescent IRQ tells the backend it may raise
                // again.
                if !self.dist.is_pending(virq, vcpu)? {
                    handler.ack(vcpu);
                }
            }
            None => log::debug!("enabled irq {} has no handler", virq.0),
        }
        Ok(())
    }

    pub(crate) fn disable_irq(&mut self, vcpu: VcpuId, virq: VIntId) -> Result<(), GicError> {
        // Whether SGIs can be disabled is IMPLEMENTATION DEFINED; here the
        // request is ignored. Guests commonly try during boot, so nothing
        // is logged.
        if (virq.0 as usize) < NUM_SGI_VIRQS {
            return Ok(());
        }
        log::debug!("disabling irq {}", virq.0);
        self.dist.set_enable(virq, false, vcpu)
    }

    pub(crate) fn set_pending_irq<H: VgicHw>(
        &mut self,
        hw: &mut H,
        vcpu: VcpuId,
        virq: VIntId,
    ) -> Result<(), GicError> {
        let idx = self.dist.vcpu_index(vcpu)?;
        let handler = match self.handlers.find(idx, virq) {
            Some(handler) => *handler,
            None => {
                log::debug!("irq {} has no handler on vcpu {}", virq.0, vcpu.0);
                return Err(GicError::NotDeliverable);
            }
        };
        if !self.dist.dist_enabled() || !self.dist.is_enabled(virq, vcpu)? {
            log::debug!("irq {} not enabled on vcpu {}", virq.0, vcpu.0);
            return Err(GicError::NotDeliverable);
        }
        if self.dist.is_pending(virq, vcpu)? {
            return Ok(());
        }

        log::debug!("pending set: inject irq {} on vcpu {}", virq.0, vcpu.0);
        self.dist.set_pending(virq, true, vcpu)?;

        // The queue hop on the fast path keeps delivery order uniform with
        // the overflow case.
        if let Err(err) = self.inject[idx].queue.enqueue(handler) {
            log::error!(
                "irq queue overflow on vcpu {}; raise MAX_IRQ_QUEUE_LEN",
                vcpu.0
            );
            return Err(err);
        }

        let Some(lr) = self.inject[idx].find_empty_lr() else {
            // No list register free; the maintenance path will promote the
            // queued entry once one retires.
            return Ok(());
        };
        let next = self.inject[idx]
            .queue
            .dequeue()
            .ok_or(GicError::InvalidState)?;
        hw.load_list_reg(vcpu, lr, &next)?;
        self.inject[idx].shadow_lr(lr, next);
        Ok(())
    }

    pub(crate) fn clr_pending_irq(&mut self, vcpu: VcpuId, virq: VIntId) -> Result<(), GicError> {
        log::debug!("clear pending irq {}", virq.0);
        // TODO: also drop matching entries from the overflow ring and the
        // loaded list registers.
        self.dist.set_pending(virq, false, vcpu)
    }

    /// Decode an SGIR write from `vcpu` and fan the SGI out to its online
    /// targets.
    pub(crate) fn dispatch_sgi<H: VgicHw>(
        &mut self,
        hw: &mut H,
        vcpu: VcpuId,
        value: u32,
    ) -> Result<(), GicError> {
        let sgir = GicdSgir::from_bits(value);
        let Some(filter) = TargetListFilter::from_bits(sgir.target_list_filter()) else {
            log::error!("unknown SGIR target list filter");
            return Ok(());
        };
        let virq = VIntId(sgir.sgi_int_id() as u32);
        let targets = sgir_target_mask(
            self.vcpu_count(),
            vcpu,
            filter,
            sgir.cpu_target_list(),
        );
        for i in 0..self.vcpu_count() {
            let target = VcpuId(i as u16);
            if targets & (1 << i) == 0 || !hw.is_vcpu_online(target) {
                continue;
            }
            // Undeliverable SGIs are dropped, like any external injection.
            match self.inject_irq(hw, target, virq) {
                Ok(()) | Err(GicError::NotDeliverable) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn vcpu_inject(&self, idx: usize) -> &VcpuInject {
        &self.inject[idx]
    }
}
