//! Image-folder dataset
//!
//! Loads a class-per-subdirectory dataset layout:
//!
//! ```text
//! dataset/cifar_subset/
//! ├── airplane/
//! │   ├── 0001.png
//! │   └── 0002.png
//! └── bird/
//!     └── ...
//! ```
//!
//! Discovery is eager (paths and labels), decoding is lazy: images are read,
//! resized and normalized on [`Dataset::get`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use image::imageops::FilterType;
use image::ImageReader;
use tracing::{debug, info};
use walkdir::WalkDir;

use super::Dataset;
use crate::error::{Error, Result};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

/// One discovered image file
#[derive(Debug, Clone)]
struct ImageEntry {
    path: PathBuf,
    label: u32,
}

/// A labeled image dataset backed by a directory tree
pub struct ImageFolderDataset {
    entries: Vec<ImageEntry>,
    class_names: Vec<String>,
    img_size: usize,
}

impl ImageFolderDataset {
    /// Scan `root` for class subdirectories and their image files.
    ///
    /// Fails with a dataset error when the root is missing or no image file
    /// is found; an empty dataset cannot be trained on.
    pub fn new<P: AsRef<Path>>(root: P, img_size: usize) -> Result<Self> {
        let root = root.as_ref();
        info!(path = %root.display(), img_size, "scanning image folder dataset");

        if !root.is_dir() {
            return Err(Error::dataset(format!(
                "dataset directory does not exist: {}",
                root.display()
            )));
        }

        let mut class_names: Vec<String> = Vec::new();
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    class_names.push(name.to_string());
                }
            }
        }
        class_names.sort();

        let class_to_label: HashMap<&str, u32> = class_names
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.as_str(), idx as u32))
            .collect();

        let mut entries = Vec::new();
        for class_name in &class_names {
            let label = class_to_label[class_name.as_str()];
            for entry in WalkDir::new(root.join(class_name))
                .min_depth(1)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                let path = entry.path();
                if !entry.file_type().is_file() {
                    continue;
                }
                let is_image = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
                    .unwrap_or(false);
                if is_image {
                    entries.push(ImageEntry {
                        path: path.to_path_buf(),
                        label,
                    });
                }
            }
            debug!(class = %class_name, "class scanned");
        }

        if entries.is_empty() {
            return Err(Error::dataset(format!(
                "dataset at {} contains no image files",
                root.display()
            )));
        }

        info!(
            samples = entries.len(),
            classes = class_names.len(),
            "dataset ready"
        );

        Ok(Self {
            entries,
            class_names,
            img_size,
        })
    }

    /// Class names in label order.
    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    fn load_image(&self, path: &Path) -> Result<Tensor> {
        let img = ImageReader::open(path)?.decode()?;
        let img = img.resize_exact(
            self.img_size as u32,
            self.img_size as u32,
            FilterType::Triangle,
        );
        let raw = img.to_rgb8().into_raw();
        let tensor = Tensor::from_vec(raw, (self.img_size, self.img_size, 3), &Device::Cpu)?
            .permute((2, 0, 1))?
            .to_dtype(DType::F32)?;
        Ok((tensor / 255.0)?)
    }
}

impl Dataset for ImageFolderDataset {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    fn get(&self, index: usize) -> Result<(Tensor, u32)> {
        let entry = self.entries.get(index).ok_or_else(|| {
            Error::dataset(format!("index {index} out of range ({})", self.entries.len()))
        })?;
        let image = self.load_image(&entry.path)?;
        Ok((image, entry.label))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    fn write_dataset(root: &Path, classes: &[(&str, usize)]) {
        for (class, count) in classes {
            let dir = root.join(class);
            std::fs::create_dir_all(&dir).unwrap();
            for i in 0..*count {
                let img = RgbImage::from_pixel(6, 6, Rgb([i as u8 * 10, 0, 200]));
                img.save(dir.join(format!("{i}.png"))).unwrap();
            }
        }
    }

    #[test]
    fn test_discovery_and_labels() {
        let dir = TempDir::new().unwrap();
        write_dataset(dir.path(), &[("bird", 3), ("airplane", 2)]);

        let dataset = ImageFolderDataset::new(dir.path(), 4).unwrap();
        assert_eq!(dataset.len(), 5);
        assert_eq!(dataset.num_classes(), 2);
        // Classes are sorted, so airplane gets label 0.
        assert_eq!(dataset.class_names(), &["airplane", "bird"]);
    }

    #[test]
    fn test_get_decodes_and_resizes() {
        let dir = TempDir::new().unwrap();
        write_dataset(dir.path(), &[("only", 1)]);

        let dataset = ImageFolderDataset::new(dir.path(), 4).unwrap();
        let (image, label) = dataset.get(0).unwrap();
        assert_eq!(image.dims(), &[3, 4, 4]);
        assert_eq!(image.dtype(), DType::F32);
        assert_eq!(label, 0);

        let max = image.max_all().unwrap().to_scalar::<f32>().unwrap();
        assert!((0.0..=1.0).contains(&max));
    }

    #[test]
    fn test_missing_root_is_dataset_error() {
        let err = ImageFolderDataset::new("/nonexistent/dataset", 4).err().unwrap();
        assert!(matches!(err, Error::Dataset(_)));
    }

    #[test]
    fn test_empty_root_is_dataset_error() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("empty_class")).unwrap();
        let err = ImageFolderDataset::new(dir.path(), 4).err().unwrap();
        assert!(matches!(err, Error::Dataset(_)));
    }
}
