//! Cross-entropy loss over one-hot targets and class predictions

use candle_core::{DType, Tensor};

use crate::error::{Error, Result};

/// Expand `(B, H, W)` class indices into a `(B, C, H, W)` indicator tensor
pub fn one_hot(labels: &Tensor, num_classes: usize) -> Result<Tensor> {
    let labels = labels.to_dtype(DType::U32)?;
    let max_label = labels.max_all()?.to_scalar::<u32>()? as usize;
    if max_label >= num_classes {
        return Err(Error::invalid_input(format!(
            "label {max_label} out of range for {num_classes} classes"
        )));
    }

    let classes = Tensor::arange(0u32, num_classes as u32, labels.device())?
        .reshape((1, num_classes, 1, 1))?;
    Ok(labels
        .unsqueeze(1)?
        .broadcast_eq(&classes)?
        .to_dtype(DType::F32)?)
}

/// Mean over pixels of `-sum_c target_c * log_softmax(logits)_c`
pub fn cross_entropy(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    if logits.dims() != targets.dims() {
        return Err(Error::shape_mismatch(targets.dims(), logits.dims()));
    }

    let log_probs = candle_nn::ops::log_softmax(logits, 1)?;
    let per_pixel = (log_probs * targets)?.sum(1)?;
    Ok(per_pixel.mean_all()?.neg()?)
}

/// Collapse `(B, C, H, W)` scores to `(B, H, W)` predicted class indices
pub fn argmax_classes(scores: &Tensor) -> Result<Tensor> {
    Ok(scores.argmax(1)?)
}

/// Fraction of pixels whose prediction equals the target, background included
pub fn pixel_accuracy(predictions: &Tensor, targets: &Tensor) -> Result<f64> {
    if predictions.dims() != targets.dims() {
        return Err(Error::shape_mismatch(targets.dims(), predictions.dims()));
    }
    let total = targets.elem_count();
    if total == 0 {
        return Ok(0.0);
    }

    let correct = predictions
        .to_dtype(DType::U32)?
        .eq(&targets.to_dtype(DType::U32)?)?
        .to_dtype(DType::U32)?
        .sum_all()?
        .to_scalar::<u32>()?;
    Ok(correct as f64 / total as f64)
}

/// Scalar value of a loss tensor
pub fn loss_value(loss: &Tensor) -> Result<f64> {
    Ok(loss.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::Device;

    #[test]
    fn test_one_hot_layout() {
        let labels = Tensor::new(&[[[0u32, 2], [1, 0]]], &Device::Cpu).unwrap();
        let encoded = one_hot(&labels, 3).unwrap();
        assert_eq!(encoded.dims(), &[1, 3, 2, 2]);

        let class2 = encoded.get(0).unwrap().get(2).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(class2, vec![vec![0.0, 1.0], vec![0.0, 0.0]]);
        assert_eq!(encoded.sum_all().unwrap().to_scalar::<f32>().unwrap(), 4.0);
    }

    #[test]
    fn test_one_hot_rejects_out_of_range() {
        let labels = Tensor::new(&[[[3u32]]], &Device::Cpu).unwrap();
        assert!(matches!(one_hot(&labels, 3), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_uniform_logits_cross_entropy_is_log_classes() {
        let logits = Tensor::zeros((2, 4, 3, 3), DType::F32, &Device::Cpu).unwrap();
        let labels = Tensor::zeros((2, 3, 3), DType::U32, &Device::Cpu).unwrap();
        let loss = cross_entropy(&logits, &one_hot(&labels, 4).unwrap()).unwrap();
        assert_relative_eq!(loss_value(&loss).unwrap(), 4f64.ln(), epsilon = 1e-5);
    }

    #[test]
    fn test_cross_entropy_shape_mismatch() {
        let logits = Tensor::zeros((1, 4, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::zeros((1, 3, 2, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            cross_entropy(&logits, &targets),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_argmax_and_accuracy() {
        let labels = Tensor::new(&[[[0u32, 2], [1, 1]]], &Device::Cpu).unwrap();
        let scores = one_hot(&labels, 3).unwrap();
        let predictions = argmax_classes(&scores).unwrap();
        assert_eq!(predictions.to_vec3::<u32>().unwrap(), labels.to_vec3::<u32>().unwrap());

        let wrong = Tensor::new(&[[[0u32, 2], [0, 0]]], &Device::Cpu).unwrap();
        assert_relative_eq!(pixel_accuracy(&wrong, &labels).unwrap(), 0.5);
    }
}
