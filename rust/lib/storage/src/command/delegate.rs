use domobj_core::DomainError;

use super::StorageProviderCommand;

/// Runs `inner` and maps its output through a pure projection.
pub struct DelegateBasedCommand<I, F> {
    inner: I,
    projection: F,
}

impl<I, F> DelegateBasedCommand<I, F> {
    pub fn new(inner: I, projection: F) -> Self {
        Self { inner, projection }
    }
}

impl<C, I, F, O> StorageProviderCommand<C> for DelegateBasedCommand<I, F>
where
    C: ?Sized,
    I: StorageProviderCommand<C>,
    F: Fn(I::Output) -> O,
{
    type Output = O;

    fn execute(&self, context: &C) -> Result<O, DomainError> {
        let output = self.inner.execute(context)?;
        Ok((self.projection)(output))
    }
}
