//! Port tuple allocation.
//!
//! Every instance holds a four-value port tuple. Tuples freed by
//! destroyed instances go onto a vacant list and are reused LIFO; when
//! the list is empty the allocator hands out fresh tuples one step past
//! the highest ever assigned. A tuple is never handed out while another
//! live instance still holds it.

use sashi_core::instance::{Instance, Ports};

/// Allocator state, owned by the daemon's single dispatch task.
#[derive(Debug)]
pub struct PortAllocator {
    /// Tuples freed by destroys, reused LIFO.
    vacant: Vec<Ports>,
    /// Next fresh tuple when the vacant list is empty.
    next_fresh: Ports,
    /// Whether the pending allocation came off the vacant list.
    pending_from_vacant: bool,
}

impl PortAllocator {
    /// Allocator starting from the configured initial tuple, seeded
    /// with the current instance list.
    ///
    /// Any peer port between the initial value and the current maximum
    /// that no instance holds becomes a vacant slot.
    #[must_use]
    pub fn new(init: Ports, instances: &[Instance]) -> Self {
        let mut vacant = Vec::new();
        let mut next_fresh = init;

        if let Some(max) = instances
            .iter()
            .map(|i| i.assigned_ports)
            .max_by_key(|p| p.peer_port)
        {
            let mut probe = init;
            while probe.peer_port < max.peer_port {
                if !instances
                    .iter()
                    .any(|i| i.assigned_ports.peer_port == probe.peer_port)
                {
                    vacant.push(probe);
                }
                probe = probe.next();
            }
            next_fresh = max.next();
        }

        Self {
            vacant,
            next_fresh,
            pending_from_vacant: false,
        }
    }

    /// The tuple the next create will use. Does not consume it; call
    /// [`Self::commit`] once the instance row is durably inserted.
    #[must_use]
    pub fn peek(&mut self) -> Ports {
        if let Some(&ports) = self.vacant.last() {
            self.pending_from_vacant = true;
            ports
        } else {
            self.pending_from_vacant = false;
            self.next_fresh
        }
    }

    /// Consume the tuple returned by the last [`Self::peek`].
    pub fn commit(&mut self) {
        if self.pending_from_vacant {
            self.vacant.pop();
            self.pending_from_vacant = false;
        } else {
            self.next_fresh = self.next_fresh.next();
        }
    }

    /// Return a destroyed instance's tuple for reuse.
    pub fn release(&mut self, ports: Ports) {
        if !self.vacant.contains(&ports) {
            self.vacant.push(ports);
        }
    }

    /// Vacant tuples, most recently freed last.
    #[must_use]
    pub fn vacant(&self) -> &[Ports] {
        &self.vacant
    }
}

#[cfg(test)]
mod tests {
    use sashi_core::instance::InstanceStatus;

    use super::*;

    const INIT: Ports = Ports {
        peer_port: 22861,
        user_port: 26201,
        gp_tcp_port_start: 36525,
        gp_udp_port_start: 39064,
    };

    fn instance_at(ports: Ports) -> Instance {
        Instance {
            container_name: format!("c{}", ports.peer_port),
            owner_pubkey: String::new(),
            contract_id: String::new(),
            contract_dir: String::new(),
            image_name: String::new(),
            assigned_ports: ports,
            status: InstanceStatus::Running,
            pubkey: String::new(),
            ip: String::new(),
            username: String::new(),
        }
    }

    #[test]
    fn empty_store_starts_at_initial_tuple() {
        let mut alloc = PortAllocator::new(INIT, &[]);
        assert_eq!(alloc.peek(), INIT);
        alloc.commit();
        assert_eq!(alloc.peek(), INIT.next());
        alloc.commit();
        let third = alloc.peek();
        assert_eq!(third.peer_port, 22863);
        assert_eq!(third.user_port, 26203);
        assert_eq!(third.gp_tcp_port_start, 36529);
        assert_eq!(third.gp_udp_port_start, 39068);
    }

    #[test]
    fn seed_scan_finds_holes_as_vacant() {
        // Instances at steps 0 and 2; step 1 is a hole.
        let second = INIT.next();
        let third = second.next();
        let instances = vec![instance_at(INIT), instance_at(third)];
        let mut alloc = PortAllocator::new(INIT, &instances);

        assert_eq!(alloc.vacant(), &[second]);
        assert_eq!(alloc.peek(), second);
        alloc.commit();
        // Hole consumed; next allocation is fresh past the maximum.
        assert_eq!(alloc.peek(), third.next());
    }

    #[test]
    fn released_tuples_reuse_lifo() {
        let mut alloc = PortAllocator::new(INIT, &[]);
        let a = alloc.peek();
        alloc.commit();
        let b = alloc.peek();
        alloc.commit();

        alloc.release(a);
        alloc.release(b);
        // Most recently freed first.
        assert_eq!(alloc.peek(), b);
        alloc.commit();
        assert_eq!(alloc.peek(), a);
        alloc.commit();
        // Vacant exhausted; fresh allocation continues past the max.
        assert_eq!(alloc.peek(), b.next());
    }

    #[test]
    fn double_release_is_ignored() {
        let mut alloc = PortAllocator::new(INIT, &[]);
        let a = alloc.peek();
        alloc.commit();
        alloc.release(a);
        alloc.release(a);
        assert_eq!(alloc.vacant().len(), 1);
    }

    #[test]
    fn uncommitted_peek_does_not_consume() {
        let mut alloc = PortAllocator::new(INIT, &[]);
        let a = alloc.peek();
        // Create failed; peek again yields the same tuple.
        assert_eq!(alloc.peek(), a);
        alloc.commit();
        assert_ne!(alloc.peek(), a);
    }
}
