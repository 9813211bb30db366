//! Single-band GeoTIFF reading and writing
//!
//! Only the subset of GeoTIFF the pipeline needs: one band per file, affine
//! georeferencing through `ModelTransformation` (or `ModelPixelScale` +
//! `ModelTiepoint` on read), the EPSG code from the GeoKey directory and the
//! GDAL nodata tag.

use super::{CompressionLevel, RasterError, RasterWriter};
use crate::grid::{GeoTransform, Grid};
use ndarray::{Array2, ArrayView2};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek};
use std::path::{Path, PathBuf};
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::compression::{Deflate, DeflateLevel};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;
use tiff::{TiffError, TiffResult};
use tracing::debug;

const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const MODEL_TRANSFORMATION: u16 = 34264;
const GEO_KEY_DIRECTORY: u16 = 34735;
const GDAL_NODATA: u16 = 42113;

// GeoKey ids
const GT_MODEL_TYPE: u16 = 1024;
const GT_RASTER_TYPE: u16 = 1025;
const GEOGRAPHIC_TYPE: u16 = 2048;
const PROJECTED_CS_TYPE: u16 = 3072;

const MODEL_TYPE_PROJECTED: u16 = 1;
const MODEL_TYPE_GEOGRAPHIC: u16 = 2;
const RASTER_PIXEL_IS_AREA: u16 = 1;

/// Canonical tag for a numeric id (named variant if the crate knows it)
fn tag(code: u16) -> Tag {
    Tag::from_u16_exhaustive(code)
}

/// Decoded single-band raster with whatever georeferencing it carried
#[derive(Debug, Clone)]
pub struct GeoRaster {
    /// `(row, col)` samples, nodata replaced by NaN
    pub values: Array2<f32>,
    pub transform: Option<GeoTransform>,
    pub epsg: Option<u16>,
}

/// Read a single-band GeoTIFF into `f32`
///
/// # Errors
/// - [`RasterError::Io`] / [`RasterError::Tiff`] on read or decode failure
/// - [`RasterError::UnsupportedPixelFormat`] for sample types outside the integer/float set
/// - [`RasterError::SampleCount`] for multi-band or truncated images
pub fn read_geotiff(path: &Path) -> Result<GeoRaster, RasterError> {
    let tiff_err = |source: TiffError| RasterError::Tiff {
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).map_err(|source| RasterError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut decoder = Decoder::new(BufReader::new(file)).map_err(tiff_err)?;
    let (width, height) = decoder.dimensions().map_err(tiff_err)?;
    let (rows, cols) = (height as usize, width as usize);

    let transform = read_transform(&mut decoder).map_err(tiff_err)?;
    let epsg = read_epsg(&mut decoder).map_err(tiff_err)?;
    let nodata = read_nodata(&mut decoder).map_err(tiff_err)?;

    let mut samples: Vec<f32> = match decoder.read_image().map_err(tiff_err)? {
        DecodingResult::U8(buf) => buf.into_iter().map(f32::from).collect(),
        DecodingResult::U16(buf) => buf.into_iter().map(f32::from).collect(),
        DecodingResult::U32(buf) => buf.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I8(buf) => buf.into_iter().map(f32::from).collect(),
        DecodingResult::I16(buf) => buf.into_iter().map(f32::from).collect(),
        DecodingResult::I32(buf) => buf.into_iter().map(|v| v as f32).collect(),
        DecodingResult::F32(buf) => buf,
        DecodingResult::F64(buf) => buf.into_iter().map(|v| v as f32).collect(),
        _ => return Err(RasterError::UnsupportedPixelFormat(path.to_path_buf())),
    };

    if let Some(nodata) = nodata.filter(|v| !v.is_nan()) {
        for v in &mut samples {
            if *v == nodata {
                *v = f32::NAN;
            }
        }
    }

    if samples.len() != rows * cols {
        return Err(RasterError::SampleCount {
            path: path.to_path_buf(),
            samples: samples.len(),
            rows,
            cols,
        });
    }
    let values = Array2::from_shape_vec((rows, cols), samples).map_err(|_| {
        RasterError::SampleCount {
            path: path.to_path_buf(),
            samples: rows * cols,
            rows,
            cols,
        }
    })?;

    debug!(
        "Read {}: {}x{} pixels, georeferenced={}, epsg={:?}",
        path.display(),
        rows,
        cols,
        transform.is_some(),
        epsg
    );

    Ok(GeoRaster {
        values,
        transform,
        epsg,
    })
}

fn read_transform<R: Read + Seek>(decoder: &mut Decoder<R>) -> TiffResult<Option<GeoTransform>> {
    if let Some(value) = decoder.find_tag(tag(MODEL_TRANSFORMATION))? {
        let m = value.into_f64_vec()?;
        if m.len() >= 8 {
            return Ok(Some(GeoTransform::new(m[0], m[1], m[3], m[4], m[5], m[7])));
        }
    }

    let scale = decoder.find_tag(tag(MODEL_PIXEL_SCALE))?;
    let tiepoint = decoder.find_tag(tag(MODEL_TIEPOINT))?;
    let (Some(scale), Some(tiepoint)) = (scale, tiepoint) else {
        return Ok(None);
    };
    let scale = scale.into_f64_vec()?;
    let tiepoint = tiepoint.into_f64_vec()?;
    if scale.len() < 2 || tiepoint.len() < 6 {
        return Ok(None);
    }

    // Tiepoint (i, j, k, x, y, z) pins raster position (i, j) to world (x, y)
    let origin_x = tiepoint[3] - tiepoint[0] * scale[0];
    let origin_y = tiepoint[4] + tiepoint[1] * scale[1];
    Ok(Some(GeoTransform::from_origin(
        origin_x, origin_y, scale[0], scale[1],
    )))
}

fn read_epsg<R: Read + Seek>(decoder: &mut Decoder<R>) -> TiffResult<Option<u16>> {
    let Some(value) = decoder.find_tag(tag(GEO_KEY_DIRECTORY))? else {
        return Ok(None);
    };
    Ok(epsg_from_geokeys(&value.into_u32_vec()?))
}

fn read_nodata<R: Read + Seek>(decoder: &mut Decoder<R>) -> TiffResult<Option<f32>> {
    let Some(value) = decoder.find_tag(tag(GDAL_NODATA))? else {
        return Ok(None);
    };
    let text = value.into_string()?;
    Ok(text.trim_matches(|c: char| c == '\0' || c.is_whitespace()).parse().ok())
}

/// EPSG code stored inline in a GeoKey directory
fn epsg_from_geokeys(keys: &[u32]) -> Option<u16> {
    let entries = keys.get(4..)?;
    let lookup = |id: u16| {
        entries
            .chunks_exact(4)
            .find(|entry| entry[0] == u32::from(id) && entry[1] == 0)
            .map(|entry| entry[3])
    };
    lookup(PROJECTED_CS_TYPE)
        .or_else(|| lookup(GEOGRAPHIC_TYPE))
        .and_then(|code| u16::try_from(code).ok())
}

/// GeoKey directory declaring `code` as the model CRS
fn geokeys_for(code: u16) -> [u16; 16] {
    // 4xxx codes are geographic 2D CRSs in the EPSG registry
    let (model_type, crs_key) = if (4000..5000).contains(&code) {
        (MODEL_TYPE_GEOGRAPHIC, GEOGRAPHIC_TYPE)
    } else {
        (MODEL_TYPE_PROJECTED, PROJECTED_CS_TYPE)
    };
    [
        1, 1, 0, 3, //
        GT_MODEL_TYPE, 0, 1, model_type, //
        GT_RASTER_TYPE, 0, 1, RASTER_PIXEL_IS_AREA, //
        crs_key, 0, 1, code,
    ]
}

impl From<CompressionLevel> for DeflateLevel {
    fn from(level: CompressionLevel) -> Self {
        match level {
            CompressionLevel::Fast => DeflateLevel::Fast,
            CompressionLevel::Balanced => DeflateLevel::Balanced,
            CompressionLevel::Best => DeflateLevel::Best,
        }
    }
}

/// Write `values` as a Deflate-compressed 32-bit float GeoTIFF
///
/// # Errors
/// [`RasterError::Io`] / [`RasterError::Tiff`] on create or encode failure
pub fn write_geotiff(
    path: &Path,
    grid: &Grid,
    values: ArrayView2<'_, f32>,
    level: CompressionLevel,
) -> Result<(), RasterError> {
    grid.check_shape(values.dim())?;
    let tiff_err = |source: TiffError| RasterError::Tiff {
        path: path.to_path_buf(),
        source,
    };

    let file = File::create(path).map_err(|source| RasterError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut encoder = TiffEncoder::new(BufWriter::new(file)).map_err(tiff_err)?;
    let mut image = encoder
        .new_image_with_compression::<colortype::Gray32Float, _>(
            grid.cols() as u32,
            grid.rows() as u32,
            Deflate::with_level(level.into()),
        )
        .map_err(tiff_err)?;

    let directory = image.encoder();
    directory
        .write_tag(
            tag(MODEL_TRANSFORMATION),
            &grid.transform().to_model_transformation()[..],
        )
        .map_err(tiff_err)?;
    if let Some(code) = grid.epsg_code() {
        directory
            .write_tag(tag(GEO_KEY_DIRECTORY), &geokeys_for(code)[..])
            .map_err(tiff_err)?;
    }
    directory.write_tag(tag(GDAL_NODATA), "nan").map_err(tiff_err)?;

    let samples: Vec<f32> = values.iter().copied().collect();
    image.write_data(&samples).map_err(tiff_err)?;
    Ok(())
}

/// Writes one GeoTIFF per raster into a directory
#[derive(Debug, Clone)]
pub struct GeoTiffWriter {
    dir: PathBuf,
    level: CompressionLevel,
}

impl GeoTiffWriter {
    /// Create the writer, creating `dir` if needed
    ///
    /// # Errors
    /// [`RasterError::Io`] if the directory cannot be created
    pub fn new(dir: impl Into<PathBuf>, level: CompressionLevel) -> Result<Self, RasterError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| RasterError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir, level })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl RasterWriter for GeoTiffWriter {
    fn write(
        &mut self,
        name: &str,
        grid: &Grid,
        values: ArrayView2<'_, f32>,
    ) -> Result<PathBuf, RasterError> {
        let path = self.dir.join(name);
        write_geotiff(&path, grid, values, self.level)?;
        debug!("Wrote {}", path.display());
        Ok(path)
    }

    fn location(&self) -> String {
        self.dir.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("lfmc-geotiff-{}-{name}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_geokeys_lookup() {
        let keys: Vec<u32> = geokeys_for(3308).iter().map(|&k| u32::from(k)).collect();
        assert_eq!(epsg_from_geokeys(&keys), Some(3308));

        let keys: Vec<u32> = geokeys_for(4326).iter().map(|&k| u32::from(k)).collect();
        assert_eq!(keys[7], u32::from(MODEL_TYPE_GEOGRAPHIC));
        assert_eq!(epsg_from_geokeys(&keys), Some(4326));

        assert_eq!(epsg_from_geokeys(&[1, 1, 0, 0]), None);
        assert_eq!(epsg_from_geokeys(&[]), None);
    }

    #[test]
    fn test_write_then_read_preserves_values_and_georeference() {
        let dir = scratch_dir("roundtrip");
        let grid = Grid::new(
            2,
            3,
            "EPSG:3308",
            GeoTransform::from_origin(9_000_000.0, 4_000_000.0, 20.0, 20.0),
        )
        .unwrap();
        let values = array![[1.5_f32, f32::NAN, 3.0], [4.0, 5.25, -6.0]];

        let mut writer = GeoTiffWriter::new(&dir, CompressionLevel::Fast).unwrap();
        let path = writer.write("lfmc_test.tif", &grid, values.view()).unwrap();
        assert_eq!(path, dir.join("lfmc_test.tif"));

        let raster = read_geotiff(&path).unwrap();
        assert_eq!(raster.values.dim(), (2, 3));
        assert!(raster.values[[0, 1]].is_nan());
        assert_eq!(raster.values[[1, 1]], 5.25);
        assert_eq!(raster.values[[1, 2]], -6.0);
        assert_eq!(raster.transform, Some(*grid.transform()));
        assert_eq!(raster.epsg, Some(3308));

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_write_rejects_misaligned_values() {
        let dir = scratch_dir("misaligned");
        let grid =
            Grid::new(2, 2, "EPSG:3308", GeoTransform::from_origin(0.0, 0.0, 1.0, 1.0)).unwrap();
        let values = Array2::<f32>::zeros((2, 3));
        let result = write_geotiff(&dir.join("bad.tif"), &grid, values.view(), CompressionLevel::Best);
        assert!(matches!(result, Err(RasterError::Grid(_))));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_file() {
        let result = read_geotiff(Path::new("/nonexistent/lfmc/mask.tif"));
        assert!(matches!(result, Err(RasterError::Io { .. })));
    }
}
