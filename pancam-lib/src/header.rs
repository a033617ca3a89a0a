//! PanCam image header decoding.
//!
//! Every reconstructed image file starts with a 48 byte header. The first 24
//! bytes are common to all cameras, the remaining 24 bytes depend on the camera
//! that produced the image: the wide angle cameras (WAC, left and right) or the
//! high resolution camera (HRC).
//!
//! All fields are big-endian and bit packed; offsets below are in bits from the
//! start of the header.
use std::{fs::File, io::Read, path::Path};

use serde::Serialize;

use crate::{bits, Error, Result};

/// Size of an image header in bytes.
pub const HEADER_LEN: usize = 48;

/// Camera selector values.
pub const CAMERA_WAC_LEFT: u8 = 1;
pub const CAMERA_WAC_RIGHT: u8 = 2;
pub const CAMERA_HRC: u8 = 3;

struct Fields<'a>(&'a [u8]);

impl Fields<'_> {
    fn u8(&self, offset: usize, width: usize) -> u8 {
        bits::extract(self.0, offset, width) as u8
    }

    fn u16(&self, offset: usize, width: usize) -> u16 {
        bits::extract(self.0, offset, width) as u16
    }

    fn u32(&self, offset: usize, width: usize) -> u32 {
        bits::extract(self.0, offset, width) as u32
    }

    fn u64(&self, offset: usize, width: usize) -> u64 {
        bits::extract(self.0, offset, width)
    }

    fn reserved(&self, offset: usize, width: usize) -> Result<()> {
        let value = bits::extract(self.0, offset, width);
        if value != 0 {
            return Err(Error::Header(format!(
                "reserved bits {offset}..{} (byte {}) not 0; got {value:#x}",
                offset + width,
                offset / 8
            )));
        }
        Ok(())
    }
}

/// Decoded image header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageHeader {
    pub block_type: u8,
    pub tm_criticality: u8,
    pub mms_dest: u8,
    pub instrument_id: u8,
    pub tm_type_id: u8,
    pub seq_flag: u8,
    /// Packet CUC time
    pub packet_cuc: u64,
    pub data_len: u32,
    pub ancillary_len: u8,
    pub sol: u16,
    pub task_id: u8,
    pub task_run: u8,
    /// Camera selector. See `CAMERA_*`.
    pub camera: u8,
    /// Filter wheel position, only meaningful for the WACs
    pub filter: u8,
    pub image_number: u8,
    /// Instrument (PIU) time
    pub instrument_time: u64,
    /// Camera specific fields
    pub camera_header: CameraHeader,
}

impl ImageHeader {
    /// Image identifier made of the zero padded task id, task run number and
    /// image number, e.g., `012003001`.
    #[must_use]
    pub fn image_id(&self) -> String {
        format!(
            "{:03}{:03}{:03}",
            self.task_id, self.task_run, self.image_number
        )
    }

    /// Single letter camera designation; `L`, `R` or `H`.
    #[must_use]
    pub fn camera_letter(&self) -> char {
        match self.camera_header {
            CameraHeader::Hrc(_) => 'H',
            CameraHeader::Wac(_) if self.camera == CAMERA_WAC_RIGHT => 'R',
            CameraHeader::Wac(_) => 'L',
        }
    }

    /// Name prefix for browse products of this image:
    /// `<model>-<camera><filter>_<task>_<run>_<image>_<temperature>_<integration>_`.
    ///
    /// The filter is the 2 digit filter number for the WACs and `RC` for the HRC.
    /// Temperature and integration time are raw (uncalibrated) values.
    #[must_use]
    pub fn browse_label(&self, model: &str) -> String {
        let (filter, temperature, integration) = match &self.camera_header {
            CameraHeader::Wac(wac) => (
                format!("{:02}", self.filter),
                wac.end_temperature,
                wac.integration_time,
            ),
            CameraHeader::Hrc(hrc) => ("RC".to_string(), hrc.temperature, hrc.integration_time),
        };
        format!(
            "{model}-{}{filter}_{:03}_{:03}_{:03}_{temperature:04}_{integration:07}_",
            self.camera_letter(),
            self.task_id,
            self.task_run,
            self.image_number,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum CameraHeader {
    /// Wide angle camera, left or right
    Wac(WacHeader),
    /// High resolution camera
    Hrc(HrcHeader),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WacHeader {
    pub capture_id: u8,
    pub marker_flag: u8,
    pub binning: u8,
    pub window_id: u8,
    pub start_time: u64,
    pub wac_time: u64,
    pub integration_time: u32,
    pub end_temperature: u16,
    pub inhibit_flag: u8,
    pub auto_exposure_flag: u8,
    pub padding_flag: u8,
    pub gain: u8,
    pub dummy_flag: u8,
    pub auto_exposure_success_flag: u8,
    pub image_crc: u16,
    pub packet_crc: u8,
}

impl WacHeader {
    fn decode(fields: &Fields) -> Result<Self> {
        fields.reserved(335, 1)?;
        fields.reserved(360, 24)?;
        Ok(WacHeader {
            capture_id: fields.u8(192, 2),
            marker_flag: fields.u8(194, 1),
            binning: fields.u8(195, 2),
            window_id: fields.u8(197, 3),
            start_time: fields.u64(200, 48),
            wac_time: fields.u64(248, 48),
            integration_time: fields.u32(296, 20),
            end_temperature: fields.u16(316, 12),
            inhibit_flag: fields.u8(328, 1),
            auto_exposure_flag: fields.u8(329, 1),
            padding_flag: fields.u8(330, 1),
            gain: fields.u8(331, 2),
            dummy_flag: fields.u8(333, 1),
            auto_exposure_success_flag: fields.u8(334, 1),
            image_crc: fields.u16(336, 16),
            packet_crc: fields.u8(352, 8),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HrcHeader {
    pub sharpness: u16,
    pub temperature: u16,
    pub encoder_position: u16,
    pub encoder_flag: u8,
    pub auto_image_flag: u8,
    pub auto_focus_flag: u8,
    pub manual_mode_flag: u8,
    pub image_number: u8,
    pub gain: u8,
    pub exposure_start_flag: u8,
    pub exposure_inhibit_flag: u8,
    pub encoder_error_flag: u8,
    pub auto_image_error_flag: u8,
    pub auto_focus_error_flag: u8,
    pub steps: u16,
    pub max_integration: u16,
    pub min_integration: u16,
    pub integration_time: u32,
    pub focus_x: u16,
    pub focus_y: u16,
    pub sharpness_filter_flag: u8,
    pub window_size: u8,
    pub desired_pixels: u16,
    pub auto_image_tolerance: u8,
    pub step_count: u16,
}

impl HrcHeader {
    fn decode(fields: &Fields) -> Result<Self> {
        fields.reserved(244, 1)?;
        fields.reserved(296, 4)?;
        fields.reserved(340, 1)?;
        Ok(HrcHeader {
            sharpness: fields.u16(192, 16),
            temperature: fields.u16(208, 10),
            encoder_position: fields.u16(218, 10),
            encoder_flag: fields.u8(228, 1),
            auto_image_flag: fields.u8(229, 1),
            auto_focus_flag: fields.u8(230, 1),
            manual_mode_flag: fields.u8(231, 1),
            image_number: fields.u8(232, 8),
            gain: fields.u8(240, 2),
            exposure_start_flag: fields.u8(242, 1),
            exposure_inhibit_flag: fields.u8(243, 1),
            encoder_error_flag: fields.u8(245, 1),
            auto_image_error_flag: fields.u8(246, 1),
            auto_focus_error_flag: fields.u8(247, 1),
            steps: fields.u16(248, 16),
            max_integration: fields.u16(264, 16),
            min_integration: fields.u16(280, 16),
            integration_time: fields.u32(300, 20),
            focus_x: fields.u16(320, 10),
            focus_y: fields.u16(330, 10),
            sharpness_filter_flag: fields.u8(341, 1),
            window_size: fields.u8(342, 2),
            desired_pixels: fields.u16(344, 16),
            auto_image_tolerance: fields.u8(360, 8),
            step_count: fields.u16(368, 16),
        })
    }
}

/// Decode an image header from exactly [HEADER_LEN] bytes.
///
/// # Errors
/// [Error::Header] if `buf` is not [HEADER_LEN] bytes, if any reserved field is
/// not zero, or if the camera selector is not one of the `CAMERA_*` values.
pub fn decode(buf: &[u8]) -> Result<ImageHeader> {
    if buf.len() != HEADER_LEN {
        return Err(Error::Header(format!(
            "expected {HEADER_LEN} header bytes, got {}",
            buf.len()
        )));
    }
    let fields = Fields(buf);
    fields.reserved(96, 8)?;

    let camera = fields.u8(130, 2);
    let camera_header = match camera {
        CAMERA_WAC_LEFT | CAMERA_WAC_RIGHT => CameraHeader::Wac(WacHeader::decode(&fields)?),
        CAMERA_HRC => CameraHeader::Hrc(HrcHeader::decode(&fields)?),
        _ => return Err(Error::Header(format!("invalid camera value {camera}"))),
    };

    Ok(ImageHeader {
        block_type: fields.u8(0, 1),
        tm_criticality: fields.u8(1, 2),
        mms_dest: fields.u8(3, 1),
        instrument_id: fields.u8(4, 4),
        tm_type_id: fields.u8(8, 6),
        seq_flag: fields.u8(14, 2),
        packet_cuc: fields.u64(16, 48),
        data_len: fields.u32(64, 24),
        ancillary_len: fields.u8(88, 8),
        sol: fields.u16(104, 12),
        task_id: fields.u8(116, 7),
        task_run: fields.u8(123, 7),
        camera,
        filter: fields.u8(132, 4),
        image_number: fields.u8(136, 8),
        instrument_time: fields.u64(144, 48),
        camera_header,
    })
}

/// Read and decode the header at the start of a reconstructed image file.
///
/// # Errors
/// [Error::Io] reading the file, [Error::NotEnoughData] if the file is shorter
/// than a header, or any error from [decode].
pub fn read_header<P: AsRef<Path>>(path: P) -> Result<ImageHeader> {
    let mut buf = Vec::with_capacity(HEADER_LEN);
    File::open(path)?
        .take(HEADER_LEN as u64)
        .read_to_end(&mut buf)?;
    if buf.len() < HEADER_LEN {
        return Err(Error::NotEnoughData {
            actual: buf.len(),
            minimum: HEADER_LEN,
        });
    }
    decode(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn set(buf: &mut [u8], offset: usize, width: usize, value: u64) {
        for i in 0..width {
            let bit = offset + i;
            let mask = 0x80u8 >> (bit % 8);
            if (value >> (width - 1 - i)) & 0x1 == 1 {
                buf[bit / 8] |= mask;
            } else {
                buf[bit / 8] &= !mask;
            }
        }
    }

    fn common(camera: u8) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        set(&mut buf, 0, 1, 1); // block type
        set(&mut buf, 1, 2, 2); // criticality
        set(&mut buf, 4, 4, 0x5); // instrument
        set(&mut buf, 8, 6, 33); // type id
        set(&mut buf, 14, 2, 3); // seq flag
        set(&mut buf, 16, 48, 0x1234_5678_9abc);
        set(&mut buf, 64, 24, 1_048_576);
        set(&mut buf, 88, 8, 24);
        set(&mut buf, 104, 12, 4095); // sol
        set(&mut buf, 116, 7, 12); // task id
        set(&mut buf, 123, 7, 3); // task run
        set(&mut buf, 130, 2, u64::from(camera));
        set(&mut buf, 132, 4, 7); // filter
        set(&mut buf, 136, 8, 1); // image number
        set(&mut buf, 144, 48, 0xfedc_ba98_7654);
        buf
    }

    fn wac(camera: u8) -> [u8; HEADER_LEN] {
        let mut buf = common(camera);
        set(&mut buf, 192, 2, 1);
        set(&mut buf, 195, 2, 2); // binning
        set(&mut buf, 197, 3, 5); // window id
        set(&mut buf, 200, 48, 0xaaaa_bbbb_cccc);
        set(&mut buf, 248, 48, 1);
        set(&mut buf, 296, 20, 0xf_ffff);
        set(&mut buf, 316, 12, 2048);
        set(&mut buf, 331, 2, 3); // gain
        set(&mut buf, 334, 1, 1);
        set(&mut buf, 336, 16, 0xbeef);
        set(&mut buf, 352, 8, 0x7e);
        buf
    }

    fn hrc() -> [u8; HEADER_LEN] {
        let mut buf = common(CAMERA_HRC);
        set(&mut buf, 192, 16, 40000); // sharpness
        set(&mut buf, 208, 10, 600); // temperature
        set(&mut buf, 218, 10, 1023); // encoder position
        set(&mut buf, 229, 1, 1);
        set(&mut buf, 232, 8, 9);
        set(&mut buf, 240, 2, 2);
        set(&mut buf, 247, 1, 1);
        set(&mut buf, 248, 16, 100);
        set(&mut buf, 264, 16, 5000);
        set(&mut buf, 280, 16, 10);
        set(&mut buf, 300, 20, 123_456);
        set(&mut buf, 320, 10, 512);
        set(&mut buf, 330, 10, 256);
        set(&mut buf, 341, 1, 1);
        set(&mut buf, 342, 2, 2);
        set(&mut buf, 344, 16, 65535);
        set(&mut buf, 360, 8, 4);
        set(&mut buf, 368, 16, 321);
        buf
    }

    #[test]
    fn decode_common_fields() {
        let header = decode(&wac(CAMERA_WAC_LEFT)).unwrap();

        assert_eq!(header.block_type, 1);
        assert_eq!(header.tm_criticality, 2);
        assert_eq!(header.mms_dest, 0);
        assert_eq!(header.instrument_id, 0x5);
        assert_eq!(header.tm_type_id, 33);
        assert_eq!(header.seq_flag, 3);
        assert_eq!(header.packet_cuc, 0x1234_5678_9abc);
        assert_eq!(header.data_len, 1_048_576);
        assert_eq!(header.ancillary_len, 24);
        assert_eq!(header.sol, 4095);
        assert_eq!(header.task_id, 12);
        assert_eq!(header.task_run, 3);
        assert_eq!(header.camera, CAMERA_WAC_LEFT);
        assert_eq!(header.filter, 7);
        assert_eq!(header.image_number, 1);
        assert_eq!(header.instrument_time, 0xfedc_ba98_7654);
        assert_eq!(header.image_id(), "012003001");
    }

    #[test_case(CAMERA_WAC_LEFT, 'L'; "left")]
    #[test_case(CAMERA_WAC_RIGHT, 'R'; "right")]
    fn decode_wac(camera: u8, letter: char) {
        let header = decode(&wac(camera)).unwrap();
        assert_eq!(header.camera_letter(), letter);

        let CameraHeader::Wac(wac) = &header.camera_header else {
            panic!("expected WAC header, got {:?}", header.camera_header);
        };
        assert_eq!(wac.capture_id, 1);
        assert_eq!(wac.marker_flag, 0);
        assert_eq!(wac.binning, 2);
        assert_eq!(wac.window_id, 5);
        assert_eq!(wac.start_time, 0xaaaa_bbbb_cccc);
        assert_eq!(wac.wac_time, 1);
        assert_eq!(wac.integration_time, 0xf_ffff);
        assert_eq!(wac.end_temperature, 2048);
        assert_eq!(wac.inhibit_flag, 0);
        assert_eq!(wac.gain, 3);
        assert_eq!(wac.auto_exposure_success_flag, 1);
        assert_eq!(wac.image_crc, 0xbeef);
        assert_eq!(wac.packet_crc, 0x7e);
    }

    #[test]
    fn decode_hrc() {
        let header = decode(&hrc()).unwrap();
        assert_eq!(header.camera_letter(), 'H');

        let CameraHeader::Hrc(hrc) = &header.camera_header else {
            panic!("expected HRC header, got {:?}", header.camera_header);
        };
        assert_eq!(hrc.sharpness, 40000);
        assert_eq!(hrc.temperature, 600);
        assert_eq!(hrc.encoder_position, 1023);
        assert_eq!(hrc.encoder_flag, 0);
        assert_eq!(hrc.auto_image_flag, 1);
        assert_eq!(hrc.image_number, 9);
        assert_eq!(hrc.gain, 2);
        assert_eq!(hrc.auto_focus_error_flag, 1);
        assert_eq!(hrc.steps, 100);
        assert_eq!(hrc.max_integration, 5000);
        assert_eq!(hrc.min_integration, 10);
        assert_eq!(hrc.integration_time, 123_456);
        assert_eq!(hrc.focus_x, 512);
        assert_eq!(hrc.focus_y, 256);
        assert_eq!(hrc.sharpness_filter_flag, 1);
        assert_eq!(hrc.window_size, 2);
        assert_eq!(hrc.desired_pixels, 65535);
        assert_eq!(hrc.auto_image_tolerance, 4);
        assert_eq!(hrc.step_count, 321);
    }

    #[test_case(0; "zero")]
    fn invalid_camera(camera: u8) {
        let err = decode(&common(camera)).unwrap_err();
        assert!(matches!(err, Error::Header(_)), "{err:?}");
    }

    #[test_case(0; "empty")]
    #[test_case(47; "short")]
    #[test_case(49; "long")]
    fn wrong_length(len: usize) {
        let buf = vec![0u8; len];
        let err = decode(&buf).unwrap_err();
        assert!(matches!(err, Error::Header(_)), "{err:?}");
    }

    #[test_case(CAMERA_WAC_LEFT, 96, 8; "common byte 12")]
    #[test_case(CAMERA_WAC_RIGHT, 335, 1; "wac byte 41 bit 0")]
    #[test_case(CAMERA_WAC_LEFT, 360, 24; "wac bytes 45-47")]
    #[test_case(CAMERA_HRC, 96, 8; "hrc common byte 12")]
    #[test_case(CAMERA_HRC, 244, 1; "hrc byte 30 bit 3")]
    #[test_case(CAMERA_HRC, 296, 4; "hrc byte 37 high nibble")]
    #[test_case(CAMERA_HRC, 340, 1; "hrc byte 42 bit 3")]
    fn reserved_not_zero(camera: u8, offset: usize, width: usize) {
        let mut buf = if camera == CAMERA_HRC {
            hrc()
        } else {
            wac(camera)
        };
        assert!(decode(&buf).is_ok(), "should decode with reserved bits clear");

        set(&mut buf, offset + width - 1, 1, 1);
        let err = decode(&buf).unwrap_err();
        assert!(matches!(err, Error::Header(_)), "{err:?}");
    }

    #[test]
    fn wac_ignores_hrc_reserved_bits() {
        // bit 244 is the WAC start time; only reserved for the HRC
        let mut buf = wac(CAMERA_WAC_LEFT);
        set(&mut buf, 244, 1, 1);
        assert!(decode(&buf).is_ok());
    }

    #[test]
    fn browse_label() {
        let header = decode(&wac(CAMERA_WAC_RIGHT)).unwrap();
        assert_eq!(
            header.browse_label("FM"),
            "FM-R07_012_003_001_2048_1048575_"
        );

        let header = decode(&hrc()).unwrap();
        assert_eq!(header.browse_label("FM"), "FM-HRC_012_003_001_0600_0123456_");
    }

    #[test]
    fn read_header_from_file() {
        let tmpdir = tempfile::tempdir().unwrap();
        let path = tmpdir.path().join("191114_170324_7.pci_raw");
        let mut dat = hrc().to_vec();
        dat.extend_from_slice(&[0xff; 100]);
        std::fs::write(&path, &dat).unwrap();

        let header = read_header(&path).unwrap();
        assert_eq!(header.camera, CAMERA_HRC);

        std::fs::write(&path, &dat[..20]).unwrap();
        let err = read_header(&path).unwrap_err();
        assert!(matches!(
            err,
            Error::NotEnoughData {
                actual: 20,
                minimum: HEADER_LEN
            }
        ));
    }
}
