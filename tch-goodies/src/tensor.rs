use crate::common::*;

pub trait TensorExt {
    fn is_empty(&self) -> bool;

    /// Ensure the tensor lives on the expected device.
    fn ensure_device(&self, device: Device) -> Result<()>;
}

impl TensorExt for Tensor {
    fn is_empty(&self) -> bool {
        self.numel() == 0
    }

    fn ensure_device(&self, device: Device) -> Result<()> {
        let actual = self.device();
        ensure!(
            actual == device,
            "device mismatch: expect {:?}, but found {:?}",
            device,
            actual
        );
        Ok(())
    }
}
