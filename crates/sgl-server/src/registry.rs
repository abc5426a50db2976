//! Per-client connections and their GL contexts.

use std::collections::BTreeMap;
use std::ops::Bound;

use sgl_protocol::ClientId;

use crate::backend::GlBackend;
use crate::error::BackendError;

/// The blob staged by `Upload`, `UploadStay` or `UploadNull`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PendingUpload {
    data: Option<Vec<u8>>,
    stay: bool,
}

impl PendingUpload {
    /// Stages `data` (`None` is an explicit null). A staying blob is offered to every
    /// following consumer until something else is staged.
    pub fn stage(&mut self, data: Option<Vec<u8>>, stay: bool) {
        self.data = data;
        self.stay = stay;
    }

    /// Hands the blob to one consumer. Pass it back through [`Self::settle`] afterwards.
    pub fn take(&mut self) -> Option<Vec<u8>> {
        self.data.take()
    }

    /// Returns a consumed blob; only staying blobs are kept.
    pub fn settle(&mut self, used: Option<Vec<u8>>) {
        if self.stay {
            self.data = used;
        }
    }

    pub fn is_staged(&self) -> bool {
        self.data.is_some()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug)]
pub struct Connection<C> {
    pub id: ClientId,
    pub context: C,
    pub upload: PendingUpload,
    /// Last size from `ReportDimensions`.
    pub dimensions: Option<(u32, u32)>,
}

/// Connections keyed by client id, each owning one backend context.
///
/// At most one context is current on the dispatcher thread; the registry remembers
/// which so that switching only happens when a different client runs.
#[derive(Debug)]
pub struct ConnectionRegistry<C> {
    connections: BTreeMap<ClientId, Connection<C>>,
    current: Option<ClientId>,
    cursor: Option<ClientId>,
}

impl<C> Default for ConnectionRegistry<C> {
    fn default() -> Self {
        Self {
            connections: BTreeMap::new(),
            current: None,
            cursor: None,
        }
    }
}

impl<C> ConnectionRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context for `id`, replacing (and destroying) a stale entry.
    pub fn add<B>(
        &mut self,
        backend: &mut B,
        id: ClientId,
        version: (u32, u32),
    ) -> Result<&mut Connection<C>, BackendError>
    where
        B: GlBackend<Context = C>,
    {
        let context = backend.create_context(version)?;
        let conn = Connection {
            id,
            context,
            upload: PendingUpload::default(),
            dimensions: None,
        };
        if let Some(stale) = self.connections.remove(&id) {
            tracing::debug!(client = %id, "replacing stale connection");
            self.release(backend, stale);
        }
        Ok(self.connections.entry(id).or_insert(conn))
    }

    /// Destroys the connection of `id`. Returns `false` if there was none.
    pub fn remove<B>(&mut self, backend: &mut B, id: ClientId) -> bool
    where
        B: GlBackend<Context = C>,
    {
        match self.connections.remove(&id) {
            Some(conn) => {
                self.release(backend, conn);
                true
            }
            None => false,
        }
    }

    /// Swaps the context of `id` for a fresh one. The pending upload and dimensions
    /// survive.
    pub fn replace_context<B>(
        &mut self,
        backend: &mut B,
        id: ClientId,
        version: (u32, u32),
    ) -> Result<bool, BackendError>
    where
        B: GlBackend<Context = C>,
    {
        if !self.connections.contains_key(&id) {
            return Ok(false);
        }
        let fresh = backend.create_context(version)?;
        let was_current = self.current == Some(id);
        if was_current {
            backend.make_current(None)?;
            self.current = None;
        }
        let Some(conn) = self.connections.get_mut(&id) else {
            return Ok(false);
        };
        let old = std::mem::replace(&mut conn.context, fresh);
        backend.destroy_context(old);
        if let Some((w, h)) = conn.dimensions {
            backend.resize(&mut conn.context, w, h)?;
        }
        if was_current {
            backend.make_current(Some(&mut conn.context))?;
            self.current = Some(id);
        }
        Ok(true)
    }

    /// Makes the context of `id` current and returns its connection.
    pub fn current<B>(
        &mut self,
        backend: &mut B,
        id: ClientId,
    ) -> Result<Option<&mut Connection<C>>, BackendError>
    where
        B: GlBackend<Context = C>,
    {
        let Some(conn) = self.connections.get_mut(&id) else {
            return Ok(None);
        };
        if self.current != Some(id) {
            backend.make_current(Some(&mut conn.context))?;
            self.current = Some(id);
        }
        Ok(Some(conn))
    }

    /// The client whose context is current, if any.
    pub fn active(&self) -> Option<ClientId> {
        self.current
    }

    /// Round-robin over connected clients in id order.
    pub fn next(&mut self) -> Option<ClientId> {
        let after = self
            .cursor
            .and_then(|c| {
                self.connections
                    .range((Bound::Excluded(c), Bound::Unbounded))
                    .next()
            })
            .or_else(|| self.connections.iter().next())
            .map(|(id, _)| *id);
        self.cursor = after;
        after
    }

    pub fn get(&self, id: ClientId) -> Option<&Connection<C>> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut Connection<C>> {
        self.connections.get_mut(&id)
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.connections.keys().copied()
    }

    /// Destroys every connection.
    pub fn clear<B>(&mut self, backend: &mut B)
    where
        B: GlBackend<Context = C>,
    {
        let ids: Vec<ClientId> = self.ids().collect();
        for id in ids {
            self.remove(backend, id);
        }
    }

    fn release<B>(&mut self, backend: &mut B, conn: Connection<C>)
    where
        B: GlBackend<Context = C>,
    {
        if self.current == Some(conn.id) {
            if let Err(err) = backend.make_current(None) {
                tracing::warn!(client = %conn.id, %err, "failed to detach context");
            }
            self.current = None;
        }
        if self.cursor == Some(conn.id) {
            self.cursor = self
                .connections
                .range(..conn.id)
                .next_back()
                .map(|(id, _)| *id);
        }
        backend.destroy_context(conn.context);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staying_upload_survives_consumers() {
        let mut upload = PendingUpload::default();
        upload.stage(Some(vec![1, 2]), true);
        let data = upload.take();
        assert_eq!(data.as_deref(), Some(&[1, 2][..]));
        upload.settle(data);
        assert!(upload.is_staged());

        upload.stage(Some(vec![3]), false);
        let data = upload.take();
        upload.settle(data);
        assert!(!upload.is_staged());
    }
}
