/// Index-addressed table of per-session handles.
///
/// Freed slots are reused before the table grows; the table never shrinks
/// while the session lives, so an index stays meaningful until it is closed.
#[derive(Debug)]
pub struct HandleTable<T> {
    slots: Vec<Option<T>>,
    free: Vec<usize>,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }
}

impl<T> HandleTable<T> {
    pub fn insert(&mut self, value: T) -> remote::Result<usize> {
        if let Some(index) = self.free.pop() {
            self.slots[index] = Some(value);
            return Ok(index);
        }
        self.slots.try_reserve(1).map_err(|e| {
            remote::Error::Allocation(format!(
                "handle table of {} entries: {e}",
                self.slots.len()
            ))
        })?;
        // reserve now so remove() never has to allocate
        self.free.try_reserve(self.slots.len() + 1).map_err(|e| {
            remote::Error::Allocation(format!("handle free list: {e}"))
        })?;
        self.slots.push(Some(value));
        Ok(self.slots.len() - 1)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slots.get_mut(index).and_then(Option::as_mut)
    }

    pub fn remove(&mut self, index: usize) -> Option<T> {
        let value = self.slots.get_mut(index)?.take()?;
        self.free.push(index);
        Some(value)
    }

    /// Remove every open handle, leaving the table's size untouched.
    pub fn drain(&mut self) -> Vec<T> {
        let mut values = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(value) = slot.take() {
                self.free.push(index);
                values.push(value);
            }
        }
        values
    }

    pub fn open_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Number of slots ever allocated.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}
