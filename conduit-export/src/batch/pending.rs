use conduit_packet::Packet;

/// Packets whose records are already in the current message.
///
/// Bounded by `capacity`; a push beyond it is refused and the packet handed back.
#[derive(Debug)]
pub struct PendingBatch {
    packets: Vec<Packet>,
    capacity: usize,
}

impl PendingBatch {
    pub fn new(capacity: usize) -> Self {
        Self {
            packets: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.packets.len() >= self.capacity
    }

    pub fn try_push(&mut self, packet: Packet) -> Result<(), Packet> {
        if self.is_full() {
            return Err(packet);
        }
        self.packets.push(packet);
        Ok(())
    }

    /// Empty the batch, handing every packet to the caller in arrival order.
    pub fn take_all(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.packets)
    }

    /// Release every packet and clear the batch. Returns (packets, captured bytes).
    pub fn release_all(&mut self) -> (usize, usize) {
        let packets = self.take_all();
        let count = packets.len();
        let bytes = packets.iter().map(Packet::len).sum();
        for packet in packets {
            packet.release();
        }
        (count, bytes)
    }
}
