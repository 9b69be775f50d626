//! Sample rate conversion

use rubato::{FftFixedIn, Resampler};

use crate::{Error, Result};

/// Input frames per FFT chunk
const CHUNK_SIZE: usize = 1024;

/// Sub-chunks per FFT chunk
const SUB_CHUNKS: usize = 2;

/// Mono rate converter for audio that arrives in pieces
///
/// Input that does not fill a whole chunk is carried over to the next call.
pub struct StreamResampler {
    /// `None` when the rates match
    resampler: Option<FftFixedIn<f32>>,
    pending: Vec<f32>,
}

impl StreamResampler {
    /// Convert from `from` Hz to `to` Hz
    ///
    /// # Errors
    ///
    /// Returns error if the rates are not usable
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(from: u32, to: u32) -> Result<Self> {
        let resampler = if from == to {
            None
        } else {
            let resampler =
                FftFixedIn::<f32>::new(from as usize, to as usize, CHUNK_SIZE, SUB_CHUNKS, 1)
                    .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;
            Some(resampler)
        };

        Ok(Self {
            resampler,
            pending: Vec::new(),
        })
    }

    /// Convert as much of the input so far as fills whole chunks
    ///
    /// # Errors
    ///
    /// Returns error if resampling fails
    pub fn process(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(input.to_vec());
        };

        self.pending.extend_from_slice(input);
        let mut output = Vec::new();
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            let result = resampler
                .process(&[chunk], None)
                .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
            output.extend_from_slice(&result[0]);
        }
        Ok(output)
    }

    /// Convert whatever is left, padding the last chunk with silence
    ///
    /// # Errors
    ///
    /// Returns error if resampling fails
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(std::mem::take(&mut self.pending));
        };
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }

        let rest = [std::mem::take(&mut self.pending)];
        let result = resampler
            .process_partial(Some(&rest[..]), None)
            .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
        Ok(result.into_iter().next().unwrap_or_default())
    }
}

/// Convert a whole clip from `from` Hz to `to` Hz
///
/// # Errors
///
/// Returns error if resampling fails
pub fn resample(samples: &[f32], from: u32, to: u32) -> Result<Vec<f32>> {
    if from == to || samples.is_empty() {
        return Ok(samples.to_vec());
    }
    let mut resampler = StreamResampler::new(from, to)?;
    let mut output = resampler.process(samples)?;
    output.extend(resampler.flush()?);
    Ok(output)
}
