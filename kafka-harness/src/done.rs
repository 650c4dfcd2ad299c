use tokio_util::sync::CancellationToken;

/// Process-wide termination signal. Closed once at shutdown and never
/// reopened. Workers only ever see a [`DoneListener`].
#[derive(Debug, Clone, Default)]
pub struct DoneSignal {
    token: CancellationToken,
}

impl DoneSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Closing twice is a no-op.
    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn listener(&self) -> DoneListener {
        DoneListener {
            token: self.token.clone(),
        }
    }
}

/// Read side of a [`DoneSignal`].
#[derive(Debug, Clone)]
pub struct DoneListener {
    token: CancellationToken,
}

impl DoneListener {
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn closed(&self) {
        self.token.cancelled().await
    }

    /// A scoped signal that closes with this one, or earlier on its own,
    /// e.g. when a single partition is revoked.
    pub fn child(&self) -> DoneSignal {
        DoneSignal {
            token: self.token.child_token(),
        }
    }
}
