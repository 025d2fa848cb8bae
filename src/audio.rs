//! 音声サンプルのリサンプリングとPCMエンコード
//!
//! 入力ソケットから届くfloat32サンプルを上流のサンプルレートに変換し、
//! 16ビットリトルエンディアンPCMにエンコードする。

/// float32サンプル列を指定レートにダウンサンプリング
///
/// レート比に応じた部分区間ごとに入力サンプルを平均する。
/// 入力レートと出力レートが等しい場合は入力をそのまま返す
/// （リサンプリングによる歪みを持ち込まない）。
///
/// # Arguments
///
/// * `samples` - 入力サンプル
/// * `input_rate` - 入力サンプリングレート (Hz)
/// * `output_rate` - 出力サンプリングレート (Hz)
pub fn downsample(samples: &[f32], input_rate: u32, output_rate: u32) -> Vec<f32> {
    if input_rate == output_rate {
        return samples.to_vec();
    }

    let ratio = input_rate as f64 / output_rate as f64;
    let new_len = (samples.len() as f64 / ratio).round() as usize;
    let mut result = Vec::with_capacity(new_len);

    let mut offset_buffer = 0usize;
    for offset_result in 0..new_len {
        let next_offset_buffer = ((offset_result + 1) as f64 * ratio).round() as usize;
        let mut accum = 0.0f32;
        let mut count = 0usize;
        let mut i = offset_buffer;
        while i < next_offset_buffer && i < samples.len() {
            accum += samples[i];
            count += 1;
            i += 1;
        }
        if count > 0 {
            result.push(accum / count as f32);
        } else {
            // 区間が空になるのはアップサンプリング要求時のみ
            result.push(samples.get(offset_buffer).copied().unwrap_or(0.0));
        }
        offset_buffer = next_offset_buffer;
    }

    result
}

/// float32サンプル列を16ビットリトルエンディアンPCMにエンコード
///
/// 各サンプルを [-1, 1] にクランプし、負値は32768倍、非負値は32767倍で
/// スケーリングする（参照エンコーダとのビット互換のため非対称）。
pub fn pcm_encode(samples: &[f32]) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let s = sample.clamp(-1.0, 1.0);
        let value = if s < 0.0 {
            (s * 32768.0) as i16
        } else {
            (s * 32767.0) as i16
        };
        buffer.extend_from_slice(&value.to_le_bytes());
    }
    buffer
}

/// 入力ソケットのバイナリフレームをfloat32サンプル列として解釈
///
/// リトルエンディアンの4バイト単位で読み、端数バイトは無視する。
pub fn decode_f32_frame(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downsample_identity() {
        let samples = vec![0.1f32, -0.2, 0.3, -0.4, 0.5];
        let result = downsample(&samples, 44100, 44100);
        assert_eq!(result, samples);

        let result = downsample(&samples, 16000, 16000);
        assert_eq!(result, samples);
    }

    #[test]
    fn test_downsample_length_law() {
        // 長さは round(len * out / in)
        let samples = vec![0.0f32; 44100];
        let result = downsample(&samples, 44100, 16000);
        assert_eq!(result.len(), 16000);

        let samples = vec![0.0f32; 1000];
        let result = downsample(&samples, 48000, 16000);
        assert_eq!(result.len(), (1000.0f64 * 16000.0 / 48000.0).round() as usize);

        let samples = vec![0.0f32; 441];
        let result = downsample(&samples, 44100, 16000);
        assert_eq!(result.len(), 160);
    }

    #[test]
    fn test_downsample_averages_subranges() {
        // 2:1 のダウンサンプリングでは隣接2サンプルの平均になる
        let samples = vec![0.0f32, 1.0, 0.0, 1.0, 0.0, 1.0];
        let result = downsample(&samples, 32000, 16000);
        assert_eq!(result.len(), 3);
        for value in result {
            assert!((value - 0.5).abs() < 1e-6);
        }
    }

    #[test]
    fn test_downsample_empty() {
        let result = downsample(&[], 44100, 16000);
        assert!(result.is_empty());
    }

    #[test]
    fn test_pcm_encode_boundaries() {
        // 1.0 → 32767, -1.0 → -32768
        let bytes = pcm_encode(&[1.0, -1.0]);
        assert_eq!(bytes.len(), 4);
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), 32767);
        assert_eq!(i16::from_le_bytes([bytes[2], bytes[3]]), -32768);
    }

    #[test]
    fn test_pcm_encode_clamps_out_of_range() {
        let bytes = pcm_encode(&[2.5, -3.0]);
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), 32767);
        assert_eq!(i16::from_le_bytes([bytes[2], bytes[3]]), -32768);
    }

    #[test]
    fn test_pcm_encode_zero_and_little_endian() {
        let bytes = pcm_encode(&[0.0, 0.5]);
        assert_eq!(&bytes[0..2], &[0x00, 0x00]);
        let half = i16::from_le_bytes([bytes[2], bytes[3]]);
        assert_eq!(half, (0.5f32 * 32767.0) as i16);
    }

    #[test]
    fn test_decode_f32_frame() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0.25f32.to_le_bytes());
        bytes.extend_from_slice(&(-0.75f32).to_le_bytes());
        // 端数バイトは無視される
        bytes.push(0xFF);
        let samples = decode_f32_frame(&bytes);
        assert_eq!(samples, vec![0.25, -0.75]);
    }
}
