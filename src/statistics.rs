use crate::context::AllocatorContext;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct HeapStatistics {
    pub total_memory: usize,
    pub used_memory: usize,
    pub free_memory: usize,
    pub regions: usize,
    pub live_objects: usize,
    pub live_strings: usize,
    pub pending_cleanup: usize,
}

struct FormattedSize {
    pub size: usize,
}

impl std::fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ksize = (self.size as f64) / 1024f64;

        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024f64;

        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }

        let gsize = msize / 1024f64;

        if gsize < 1f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size }
}

impl std::fmt::Display for HeapStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Heap statistics:")?;
        writeln!(
            f,
            "  Memory in use: {} of {} ({} free)",
            formatted_size(self.used_memory),
            formatted_size(self.total_memory),
            formatted_size(self.free_memory)
        )?;
        writeln!(f, "  Regions: {}", self.regions)?;
        writeln!(f, "  Live objects: {}", self.live_objects)?;
        writeln!(f, "  Live strings: {}", self.live_strings)?;
        writeln!(f, "  Awaiting cleanup: {}", self.pending_cleanup)?;
        Ok(())
    }
}

impl AllocatorContext {
    pub fn statistics(&self) -> HeapStatistics {
        let gc = self.gc.inner.lock();
        HeapStatistics {
            total_memory: self.heap.total_memory(),
            used_memory: self.heap.used_memory(),
            free_memory: self.heap.free_memory(),
            regions: self.heap.region_count(),
            live_objects: gc.live_objects,
            live_strings: gc.live_strings,
            pending_cleanup: gc.cleanup.len(),
        }
    }
}
