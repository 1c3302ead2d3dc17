//! Patch embedding extraction
//!
//! Present patches of all classes are stacked and run through the network's
//! embedding head in chunks. The resulting rows are split back per class,
//! with a slot table that remembers which image each row came from.

use burn::tensor::{backend::Backend, Tensor, TensorData};

use crate::backend::ExecutionContext;
use crate::contrastive::patches::{ClassAligned, Patch};
use crate::model::network::{ForwardMode, SegmentationNet};
use crate::utils::error::{Result, SslError};

/// Whether extracted embeddings stay attached to the autodiff graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradientMode {
    Track,
    Detached,
}

/// Embeddings of one batch, grouped by class
#[derive(Debug, Clone)]
pub struct ClassEmbeddings<B: Backend> {
    /// Per class: `[n_c, D]` rows, `None` when the class had no patch
    rows: Vec<Option<Tensor<B, 2>>>,
    /// Per class and image: row index into `rows[class]`
    slots: Vec<Vec<Option<usize>>>,
    embedding_size: usize,
}

impl<B: Backend> ClassEmbeddings<B> {
    /// No embeddings for any class
    pub fn empty(num_classes: usize, batch_size: usize, embedding_size: usize) -> Self {
        Self {
            rows: vec![None; num_classes],
            slots: vec![vec![None; batch_size]; num_classes],
            embedding_size,
        }
    }

    /// Upload host embeddings, keeping image alignment
    #[cfg(test)]
    pub(crate) fn from_host(
        host: &ClassAligned<Vec<f32>>,
        embedding_size: usize,
        device: &B::Device,
    ) -> Self {
        let mut embeddings = Self::empty(host.num_classes(), host.batch_size(), embedding_size);
        for class in 0..host.num_classes() {
            let mut data = Vec::new();
            let mut count = 0;
            for (image, emb) in host.column(class).iter().enumerate() {
                let Some(emb) = emb.as_ref().filter(|e| e.len() == embedding_size) else {
                    continue;
                };
                data.extend_from_slice(emb);
                embeddings.slots[class][image] = Some(count);
                count += 1;
            }
            if count > 0 {
                embeddings.rows[class] = Some(Tensor::from_floats(
                    TensorData::new(data, [count, embedding_size]),
                    device,
                ));
            }
        }
        embeddings
    }

    pub fn num_classes(&self) -> usize {
        self.rows.len()
    }

    pub fn embedding_size(&self) -> usize {
        self.embedding_size
    }

    /// `[n_c, D]` rows of a class
    pub fn rows(&self, class: usize) -> Option<&Tensor<B, 2>> {
        self.rows.get(class)?.as_ref()
    }

    pub fn count(&self, class: usize) -> usize {
        self.slots
            .get(class)
            .map(|s| s.iter().filter(|v| v.is_some()).count())
            .unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        (0..self.num_classes()).map(|c| self.count(c)).sum()
    }

    /// Copy to host vectors, keeping image alignment
    pub fn to_host(&self) -> Result<ClassAligned<Vec<f32>>> {
        let batch_size = self.slots.first().map(|s| s.len()).unwrap_or(0);
        let mut host = ClassAligned::new(self.num_classes(), batch_size);

        for (class, rows) in self.rows.iter().enumerate() {
            let Some(rows) = rows else {
                continue;
            };
            let values: Vec<f32> = rows
                .clone()
                .into_data()
                .to_vec()
                .map_err(|e| SslError::TensorData(format!("{:?}", e)))?;

            for (image, slot) in self.slots[class].iter().enumerate() {
                if let Some(row) = slot {
                    let start = row * self.embedding_size;
                    host.set(class, image, Some(values[start..start + self.embedding_size].to_vec()));
                }
            }
        }

        Ok(host)
    }
}

/// Embed every present patch with the model's embedding head
///
/// `None` positions stay `None`; `chunk_size` bounds how many patches go
/// through the network at once.
pub fn extract_embeddings<B: Backend>(
    model: &SegmentationNet<B>,
    patches: &ClassAligned<Patch>,
    grad: GradientMode,
    chunk_size: usize,
    ctx: &ExecutionContext<B>,
) -> Result<ClassEmbeddings<B>> {
    let num_classes = patches.num_classes();
    let batch_size = patches.batch_size();
    let embedding_size = model.embedding_size();
    let mut embeddings = ClassEmbeddings::empty(num_classes, batch_size, embedding_size);

    let present: Vec<(usize, usize, &Patch)> = patches.iter_present().collect();
    let Some(&(_, _, first)) = present.first() else {
        return Ok(embeddings);
    };
    let (channels, size) = (first.channels, first.size);
    if present
        .iter()
        .any(|(_, _, p)| p.channels != channels || p.size != size)
    {
        return Err(SslError::InvalidInput(
            "patches of one batch must share channels and size".to_string(),
        ));
    }

    let mut outputs = Vec::new();
    for chunk in present.chunks(chunk_size.max(1)) {
        let data: Vec<f32> = chunk
            .iter()
            .flat_map(|(_, _, p)| p.data.iter().copied())
            .collect();
        let x = Tensor::<B, 4>::from_floats(
            TensorData::new(data, [chunk.len(), channels, size, size]),
            ctx.device(),
        );
        let z = model
            .forward(x, ForwardMode::Embedding)
            .embedding()
            .ok_or_else(|| SslError::Model("embedding head returned no embedding".to_string()))?;
        outputs.push(match grad {
            GradientMode::Track => z,
            GradientMode::Detached => z.detach(),
        });
    }
    let all = Tensor::cat(outputs, 0);

    // `present` is class-major, so each class owns a contiguous block of rows
    let mut start = 0;
    for class in 0..num_classes {
        let count = patches.count_present(class);
        if count == 0 {
            continue;
        }
        embeddings.rows[class] = Some(all.clone().narrow(0, start, count));
        for (row, (_, image, _)) in present[start..start + count].iter().enumerate() {
            embeddings.slots[class][*image] = Some(row);
        }
        start += count;
    }

    Ok(embeddings)
}
