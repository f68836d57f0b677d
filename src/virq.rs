//! Virtual IRQ bookkeeping: registered handlers and the per-vCPU
//! injection pipeline.
//!
//! A deliverable IRQ is either loaded into a hardware list register
//! (mirrored in `lr_shadow`) or parked in the overflow ring until the
//! maintenance path frees one.

use crate::GIC_SPI_IRQ_MIN;
use crate::GicError;
use crate::MAX_IRQ_QUEUE_LEN;
use crate::MAX_VIRQS;
use crate::NUM_LIST_REGS;
use crate::VIntId;
use crate::VcpuId;

/// Callback invoked when a virtual IRQ has been consumed by the guest, so
/// the source may raise it again.
pub type AckFn = fn(vcpu: VcpuId, virq: VIntId, token: usize);

/// One registered virtual IRQ source.
#[derive(Copy, Clone, Debug)]
pub struct VirqHandler {
    virq: VIntId,
    ack: AckFn,
    token: usize,
}

impl VirqHandler {
    pub(crate) fn new(virq: VIntId, ack: AckFn, token: usize) -> Self {
        Self { virq, ack, token }
    }

    pub fn virq(&self) -> VIntId {
        self.virq
    }

    pub fn token(&self) -> usize {
        self.token
    }

    pub(crate) fn ack(&self, vcpu: VcpuId) {
        (self.ack)(vcpu, self.virq, self.token)
    }
}

/// Registered handlers: SGI/PPI slots are banked per vCPU, SPIs share one
/// global table searched linearly.
pub(crate) struct VirqTable<const VCPUS: usize> {
    sgi_ppi: [[Option<VirqHandler>; GIC_SPI_IRQ_MIN]; VCPUS],
    spis: [Option<VirqHandler>; MAX_VIRQS],
}

impl<const VCPUS: usize> VirqTable<VCPUS> {
    pub(crate) fn new() -> Self {
        Self {
            sgi_ppi: [[None; GIC_SPI_IRQ_MIN]; VCPUS],
            spis: [None; MAX_VIRQS],
        }
    }

    pub(crate) fn register(
        &mut self,
        vcpu_idx: usize,
        handler: VirqHandler,
    ) -> Result<(), GicError> {
        let irq = handler.virq().0 as usize;
        if irq < GIC_SPI_IRQ_MIN {
            let slot = &mut self.sgi_ppi[vcpu_idx][irq];
            if slot.is_some() {
                log::error!("virq {} already registered for vcpu {}", irq, vcpu_idx);
                return Err(GicError::AlreadyRegistered);
            }
            *slot = Some(handler);
            return Ok(());
        }
        if self.find_spi(handler.virq()).is_some() {
            log::error!("spi virq {} already registered", irq);
            return Err(GicError::AlreadyRegistered);
        }
        match self.spis.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(handler);
                Ok(())
            }
            None => Err(GicError::OutOfResources),
        }
    }

    fn find_spi(&self, virq: VIntId) -> Option<&VirqHandler> {
        self.spis.iter().flatten().find(|h| h.virq() == virq)
    }

    pub(crate) fn find(&self, vcpu_idx: usize, virq: VIntId) -> Option<&VirqHandler> {
        let irq = virq.0 as usize;
        if irq < GIC_SPI_IRQ_MIN {
            self.sgi_ppi[vcpu_idx][irq].as_ref()
        } else {
            self.find_spi(virq)
        }
    }
}

/// Circular overflow buffer for IRQs that found no free list register.
/// One slot stays empty so a full ring is distinguishable from an empty
/// one.
pub(crate) struct IrqQueue {
    irqs: [Option<VirqHandler>; MAX_IRQ_QUEUE_LEN],
    head: usize,
    tail: usize,
}

impl IrqQueue {
    const fn next(i: usize) -> usize {
        (i + 1) & (MAX_IRQ_QUEUE_LEN - 1)
    }

    pub(crate) fn new() -> Self {
        Self {
            irqs: [None; MAX_IRQ_QUEUE_LEN],
            head: 0,
            tail: 0,
        }
    }

    pub(crate) fn enqueue(&mut self, irq: VirqHandler) -> Result<(), GicError> {
        if Self::next(self.tail) == self.head {
            return Err(GicError::QueueFull);
        }
        self.irqs[self.tail] = Some(irq);
        self.tail = Self::next(self.tail);
        Ok(())
    }

    pub(crate) fn dequeue(&mut self) -> Option<VirqHandler> {
        if self.head == self.tail {
            return None;
        }
        let irq = self.irqs[self.head].take();
        self.head = Self::next(self.head);
        irq
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.tail.wrapping_sub(self.head) & (MAX_IRQ_QUEUE_LEN - 1)
    }
}

/// Per-vCPU injection state: the list-register shadow plus the overflow
/// ring.
pub(crate) struct VcpuInject {
    lr_shadow: [Option<VirqHandler>; NUM_LIST_REGS],
    pub(crate) queue: IrqQueue,
}

impl VcpuInject {
    pub(crate) fn new() -> Self {
        Self {
            lr_shadow: [None; NUM_LIST_REGS],
            queue: IrqQueue::new(),
        }
    }

    /// Lowest-indexed free list register, if any.
    pub(crate) fn find_empty_lr(&self) -> Option<usize> {
        self.lr_shadow.iter().position(|slot| slot.is_none())
    }

    /// Record that hardware list register `lr` now carries `irq`.
    pub(crate) fn shadow_lr(&mut self, lr: usize, irq: VirqHandler) {
        self.lr_shadow[lr] = Some(irq);
    }

    /// Release the shadow slot for a retired list register.
    pub(crate) fn clear_lr(&mut self, lr: usize) -> Option<VirqHandler> {
        self.lr_shadow[lr].take()
    }

    #[cfg(test)]
    pub(crate) fn lr(&self, lr: usize) -> Option<&VirqHandler> {
        self.lr_shadow[lr].as_ref()
    }
}
