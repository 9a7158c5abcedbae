//! Loss selector: maps a configured tag to one of the supported segmentation losses.
//!
//! Every strategy consumes NHWC logits (one tensor per head, prediction head first),
//! one-hot NHWC labels and, for the region-masked variants, one [`RegionBox`] per sample.

use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::data::region::{clamped_span, RegionBox};
use crate::error::{Result, UnetError};
use crate::model::ops;
use crate::model::params::{LearnableParams, ParamRef};

pub const DEFAULT_REFERENCE_SIZE: usize = 256;

/// Area credited to the nested region in `shape_4` and `shape_5`.
const NESTED_REGION_AREA: f64 = 40.0 * 30.0;
const DICE_SMOOTHING: f64 = 1.0;
const DICE_EPSILON: f64 = 1e-5;
const INNER_REGION_WEIGHT: f64 = 10.0;
const NESTED_REGION_WEIGHT: f64 = 2.0;
const EDGE_SCALE: f64 = 10.0;
const EDGE_WEIGHT: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LossKind {
    CrossEntropy,
    Dice,
    DiceCrossEntropy,
    DiceCoefficient,
    Shape,
    Shape1,
    Shape2,
    Shape3,
    Shape4,
    Shape5,
    Epe,
    Epe2,
    CrossEntropyEpe,
    ShapeCrossEntropyEpe,
    EachIvd,
}

impl LossKind {
    pub const ALL: [LossKind; 15] = [
        LossKind::CrossEntropy,
        LossKind::Dice,
        LossKind::DiceCrossEntropy,
        LossKind::DiceCoefficient,
        LossKind::Shape,
        LossKind::Shape1,
        LossKind::Shape2,
        LossKind::Shape3,
        LossKind::Shape4,
        LossKind::Shape5,
        LossKind::Epe,
        LossKind::Epe2,
        LossKind::CrossEntropyEpe,
        LossKind::ShapeCrossEntropyEpe,
        LossKind::EachIvd,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LossKind::CrossEntropy => "cross_entropy",
            LossKind::Dice => "dice",
            LossKind::DiceCrossEntropy => "dice+ce",
            LossKind::DiceCoefficient => "dice_coefficient",
            LossKind::Shape => "shape",
            LossKind::Shape1 => "shape_1",
            LossKind::Shape2 => "shape_2",
            LossKind::Shape3 => "shape_3",
            LossKind::Shape4 => "shape_4",
            LossKind::Shape5 => "shape_5",
            LossKind::Epe => "EPE",
            LossKind::Epe2 => "EPE_2",
            LossKind::CrossEntropyEpe => "CE+EPE",
            LossKind::ShapeCrossEntropyEpe => "shape+CE+EPE",
            LossKind::EachIvd => "each_IVD",
        }
    }

    /// Strategies that read the per-sample region boxes.
    pub fn needs_regions(&self) -> bool {
        matches!(
            self,
            LossKind::Shape
                | LossKind::Shape1
                | LossKind::Shape2
                | LossKind::Shape3
                | LossKind::Shape4
                | LossKind::Shape5
                | LossKind::ShapeCrossEntropyEpe
                | LossKind::EachIvd
        )
    }

    /// Strategies summed over every head; the others only see the prediction head.
    pub fn uses_all_heads(&self) -> bool {
        matches!(
            self,
            LossKind::Dice
                | LossKind::DiceCrossEntropy
                | LossKind::DiceCoefficient
                | LossKind::Shape2
                | LossKind::ShapeCrossEntropyEpe
        )
    }
}

impl FromStr for LossKind {
    type Err = UnetError;

    fn from_str(s: &str) -> Result<Self> {
        LossKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnetError::InvalidConfiguration(format!("unknown loss `{s}`")))
    }
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_reference_size() -> usize {
    DEFAULT_REFERENCE_SIZE
}

/// Loss tag plus its keyword options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossConfig {
    pub name: String,
    #[serde(default)]
    pub class_weights: Option<Vec<f32>>,
    #[serde(default)]
    pub regularizer: Option<f64>,
    /// Side length behind the fixed pixel-count divisors of the region and edge losses.
    #[serde(default = "default_reference_size")]
    pub reference_size: usize,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self::new(LossKind::CrossEntropy.as_str())
    }
}

impl LossConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            class_weights: None,
            regularizer: None,
            reference_size: DEFAULT_REFERENCE_SIZE,
        }
    }

    pub fn with_class_weights(mut self, weights: Vec<f32>) -> Self {
        self.class_weights = Some(weights);
        self
    }

    pub fn with_regularizer(mut self, regularizer: f64) -> Self {
        self.regularizer = Some(regularizer);
        self
    }
}

/// A validated loss strategy ready to be evaluated.
#[derive(Debug, Clone)]
pub struct SegmentationLoss {
    kind: LossKind,
    class_weights: Option<Vec<f32>>,
    regularizer: Option<f64>,
    reference_size: usize,
    n_class: usize,
}

impl SegmentationLoss {
    /// Fails before any tensor work on an unknown tag, an unimplemented strategy or
    /// inconsistent options.
    pub fn new(config: &LossConfig, n_class: usize) -> Result<Self> {
        let kind: LossKind = config.name.parse()?;
        if kind == LossKind::EachIvd {
            return Err(UnetError::UnsupportedLoss(kind.to_string()));
        }

        if let Some(weights) = &config.class_weights {
            if weights.len() != n_class {
                return Err(UnetError::InvalidConfiguration(format!(
                    "class_weights has {} entries for {} classes",
                    weights.len(),
                    n_class
                )));
            }
            if weights.iter().any(|w| !w.is_finite()) {
                return Err(UnetError::InvalidConfiguration(
                    "class_weights must be finite".to_string(),
                ));
            }
        }
        if let Some(regularizer) = config.regularizer {
            if !regularizer.is_finite() || regularizer < 0.0 {
                return Err(UnetError::InvalidConfiguration(format!(
                    "regularizer must be a non-negative number, got {regularizer}"
                )));
            }
        }
        if config.reference_size == 0 {
            return Err(UnetError::InvalidConfiguration(
                "reference_size must be positive".to_string(),
            ));
        }

        log::info!("loss: {} (n_class={})", kind, n_class);

        Ok(Self {
            kind,
            class_weights: config.class_weights.clone(),
            regularizer: config.regularizer,
            reference_size: config.reference_size,
            n_class,
        })
    }

    pub fn kind(&self) -> LossKind {
        self.kind
    }

    /// Data term plus the optional L2 penalty over the learnable tensors of `model`.
    pub fn compute<B: Backend, M: LearnableParams<B>>(
        &self,
        logits: &[Tensor<B, 4>],
        labels: Tensor<B, 4>,
        regions: &[RegionBox],
        model: &M,
    ) -> Result<Tensor<B, 1>> {
        let data = self.data_term(logits, labels, regions)?;
        Ok(match self.regularization(&model.params()) {
            Some(penalty) => data + penalty,
            None => data,
        })
    }

    /// `regularizer * Σ‖w‖²`, or `None` when no regularizer is configured.
    pub fn regularization<B: Backend>(&self, params: &[ParamRef<B>]) -> Option<Tensor<B, 1>> {
        let regularizer = self.regularizer?;
        params
            .iter()
            .map(ParamRef::squared_norm)
            .reduce(|acc, term| acc + term)
            .map(|sum| sum.mul_scalar(regularizer))
    }

    /// The selected loss without regularization.
    pub fn data_term<B: Backend>(
        &self,
        logits: &[Tensor<B, 4>],
        labels: Tensor<B, 4>,
        regions: &[RegionBox],
    ) -> Result<Tensor<B, 1>> {
        self.check_inputs(logits, &labels, regions)?;

        let heads = if self.kind.uses_all_heads() {
            logits
        } else {
            &logits[..1]
        };
        let primary = heads[0].clone();
        let device = labels.device();

        let loss = match self.kind {
            LossKind::CrossEntropy => self.cross_entropy(primary, labels),
            LossKind::Dice => sum_terms(
                heads.iter().map(|logit| dice_loss(logit.clone(), labels.clone())),
                &device,
            ),
            LossKind::DiceCrossEntropy => sum_terms(
                heads.iter().map(|logit| {
                    mean_cross_entropy(logit.clone(), labels.clone())
                        + dice_loss(logit.clone(), labels.clone())
                }),
                &device,
            ),
            LossKind::DiceCoefficient => sum_terms(
                heads
                    .iter()
                    .map(|logit| dice_coefficient(logit.clone(), labels.clone())),
                &device,
            ),
            LossKind::Shape => self.shape(primary, labels, regions),
            LossKind::Shape1 => self.shape_1(primary, labels, regions),
            LossKind::Shape2 => sum_terms(
                heads
                    .iter()
                    .map(|logit| self.shape_2(logit.clone(), labels.clone(), regions)),
                &device,
            ),
            LossKind::Shape3 => self.shape_3(primary, labels, regions),
            LossKind::Shape4 => self.shape_4(primary, labels, regions),
            LossKind::Shape5 => self.shape_5(primary, labels, regions),
            LossKind::Epe => self.edge_discrepancy(labels, primary),
            LossKind::Epe2 => edge_magnitude_difference(labels, primary),
            LossKind::CrossEntropyEpe => {
                let ce = mean_cross_entropy(primary.clone(), labels.clone());
                let edge = self.edge_discrepancy(labels, primary).div_scalar(EDGE_SCALE);
                ce + edge.mul_scalar(EDGE_WEIGHT)
            }
            LossKind::ShapeCrossEntropyEpe => sum_terms(
                heads
                    .iter()
                    .map(|logit| self.shape_edges(logit.clone(), labels.clone(), regions)),
                &device,
            ),
            LossKind::EachIvd => return Err(UnetError::UnsupportedLoss(self.kind.to_string())),
        };

        Ok(loss)
    }

    fn check_inputs<B: Backend>(
        &self,
        logits: &[Tensor<B, 4>],
        labels: &Tensor<B, 4>,
        regions: &[RegionBox],
    ) -> Result<()> {
        let dims = labels.dims();
        if logits.is_empty() {
            return Err(UnetError::InvalidInput("no logits given to the loss".to_string()));
        }
        if dims[3] != self.n_class {
            return Err(UnetError::InvalidInput(format!(
                "labels have {} classes, loss expects {}",
                dims[3], self.n_class
            )));
        }
        if let Some(logit) = logits.iter().find(|logit| logit.dims() != dims) {
            return Err(UnetError::InvalidInput(format!(
                "logits {:?} do not match labels {:?}",
                logit.dims(),
                dims
            )));
        }

        if self.kind.needs_regions() {
            let [batch, height, width, _] = dims;
            if regions.len() != batch {
                return Err(UnetError::InvalidRegion(format!(
                    "`{}` needs one region per sample, got {} for {}",
                    self.kind,
                    regions.len(),
                    batch
                )));
            }
            for region in regions {
                region.validate(height, width)?;
            }
        }
        Ok(())
    }

    fn area(&self) -> f64 {
        (self.reference_size * self.reference_size) as f64
    }

    fn cross_entropy<B: Backend>(
        &self,
        logits: Tensor<B, 4>,
        labels: Tensor<B, 4>,
    ) -> Tensor<B, 1> {
        let Some(weights) = &self.class_weights else {
            return mean_cross_entropy(logits, labels);
        };

        let device = labels.device();
        let weights =
            Tensor::<B, 1>::from_data(TensorData::new(weights.clone(), [self.n_class]), &device)
                .reshape([1, 1, 1, self.n_class]);
        let weight_map = (labels.clone() * weights).sum_dim(3);
        (ops::softmax_cross_entropy_map(logits, labels) * weight_map).mean()
    }

    /// Mean cross-entropy left of each sample's `y_max`.
    fn shape<B: Backend>(
        &self,
        logits: Tensor<B, 4>,
        labels: Tensor<B, 4>,
        regions: &[RegionBox],
    ) -> Tensor<B, 1> {
        let device = labels.device();
        let map = ops::softmax_cross_entropy_map(logits, labels);
        let [_, height, width, _] = map.dims();

        sum_terms(
            regions.iter().enumerate().filter_map(|(sample, region)| {
                region_mean(&map, sample, 0..height, clamped_span(0, region.y_max, width))
            }),
            &device,
        )
    }

    /// Full cross-entropy minus the band right of the outer box.
    fn shape_1<B: Backend>(
        &self,
        logits: Tensor<B, 4>,
        labels: Tensor<B, 4>,
        regions: &[RegionBox],
    ) -> Tensor<B, 1> {
        let device = labels.device();
        let map = ops::softmax_cross_entropy_map(logits, labels);
        let [_, height, width, _] = map.dims();

        sum_terms(
            regions.iter().enumerate().map(|(sample, region)| {
                let rows = clamped_span(region.x_min, region.x_max, height);
                let cols = clamped_span(region.y_max + 3, width as i64, width);
                subtract(full_sum(&map, sample), region_sum(&map, sample, rows, cols))
                    .div_scalar(self.area())
            }),
            &device,
        )
    }

    fn shape_2_sample<B: Backend>(
        &self,
        map: &Tensor<B, 4>,
        sample: usize,
        region: &RegionBox,
    ) -> Tensor<B, 1> {
        let [_, height, width, _] = map.dims();
        let rows = clamped_span(region.x_min, region.x_max, height);
        let outside = clamped_span(region.y_max + 3, width as i64, width);
        let inside = clamped_span(region.y_min, region.y_max, width);

        let loss = subtract(full_sum(map, sample), region_sum(map, sample, rows.clone(), outside));
        add_weighted(loss, region_sum(map, sample, rows, inside), INNER_REGION_WEIGHT)
            .div_scalar(2.0 * self.area())
    }

    /// Full cross-entropy minus the band right of the box plus ten times the box itself.
    fn shape_2<B: Backend>(
        &self,
        logits: Tensor<B, 4>,
        labels: Tensor<B, 4>,
        regions: &[RegionBox],
    ) -> Tensor<B, 1> {
        let device = labels.device();
        let map = ops::softmax_cross_entropy_map(logits, labels);
        sum_terms(
            regions
                .iter()
                .enumerate()
                .map(|(sample, region)| self.shape_2_sample(&map, sample, region)),
            &device,
        )
    }

    fn shape_3<B: Backend>(
        &self,
        logits: Tensor<B, 4>,
        labels: Tensor<B, 4>,
        regions: &[RegionBox],
    ) -> Tensor<B, 1> {
        let device = labels.device();
        let map = ops::softmax_cross_entropy_map(logits, labels);
        let [_, height, width, _] = map.dims();
        let right_margin = width as i64 - 4;

        sum_terms(
            regions.iter().enumerate().map(|(sample, region)| {
                let rows = clamped_span(region.x_min, region.x_max, height);
                let cols = clamped_span(region.y_max + 7, right_margin, width);
                subtract(full_sum(&map, sample), region_sum(&map, sample, rows, cols))
                    .div_scalar(self.area())
            }),
            &device,
        )
    }

    fn shape_4<B: Backend>(
        &self,
        logits: Tensor<B, 4>,
        labels: Tensor<B, 4>,
        regions: &[RegionBox],
    ) -> Tensor<B, 1> {
        let device = labels.device();
        let map = ops::softmax_cross_entropy_map(logits, labels);
        let [_, height, width, _] = map.dims();
        let right_margin = width as i64 - 4;

        sum_terms(
            regions.iter().enumerate().map(|(sample, region)| {
                let band_rows = clamped_span(region.x_min + 3, region.x_max + 5, height);
                let band_cols = clamped_span(region.y_max + 3, right_margin, width);
                let loss = subtract(
                    full_sum(&map, sample),
                    region_sum(&map, sample, band_rows, band_cols),
                );
                let (rows, cols) = nested_region(region, height, width);
                add_weighted(loss, region_sum(&map, sample, rows, cols), NESTED_REGION_WEIGHT)
                    .div_scalar(self.area() + NESTED_REGION_AREA)
            }),
            &device,
        )
    }

    fn shape_5<B: Backend>(
        &self,
        logits: Tensor<B, 4>,
        labels: Tensor<B, 4>,
        regions: &[RegionBox],
    ) -> Tensor<B, 1> {
        let device = labels.device();
        let map = ops::softmax_cross_entropy_map(logits, labels);
        let [_, height, width, _] = map.dims();

        sum_terms(
            regions.iter().enumerate().map(|(sample, region)| {
                let (rows, cols) = nested_region(region, height, width);
                add_weighted(
                    full_sum(&map, sample),
                    region_sum(&map, sample, rows, cols),
                    NESTED_REGION_WEIGHT,
                )
                .div_scalar(self.area() + 2.0 * NESTED_REGION_AREA)
            }),
            &device,
        )
    }

    /// `shape_2` plus the edge discrepancy inside each sample's box.
    fn shape_edges<B: Backend>(
        &self,
        logits: Tensor<B, 4>,
        labels: Tensor<B, 4>,
        regions: &[RegionBox],
    ) -> Tensor<B, 1> {
        let device = labels.device();
        let map = ops::softmax_cross_entropy_map(logits.clone(), labels.clone());
        let [_, height, width, _] = map.dims();
        let n_class = self.n_class;

        sum_terms(
            regions.iter().enumerate().map(|(sample, region)| {
                let loss = self.shape_2_sample(&map, sample, region);
                let rows = clamped_span(region.x_min, region.x_max, height);
                let cols = clamped_span(region.y_min, region.y_max, width);
                if rows.is_empty() || cols.is_empty() {
                    return loss;
                }

                let window = [sample..sample + 1, rows, cols, 0..n_class];
                let edge = self.edge_discrepancy(
                    labels.clone().slice(window.clone()),
                    logits.clone().slice(window),
                );
                loss + edge.div_scalar(2.0)
            }),
            &device,
        )
    }

    /// `sqrt(Σ (sobel(y / max y) - sobel(l / max l))²) / reference_size`
    fn edge_discrepancy<B: Backend>(
        &self,
        labels: Tensor<B, 4>,
        logits: Tensor<B, 4>,
    ) -> Tensor<B, 1> {
        let (label_dy, label_dx) = ops::sobel_edges(ops::normalize_by_max(labels));
        let (logit_dy, logit_dx) = ops::sobel_edges(ops::normalize_by_max(logits));

        let squared = (label_dy - logit_dy).powf_scalar(2.0).sum()
            + (label_dx - logit_dx).powf_scalar(2.0).sum();
        squared.sqrt().div_scalar(self.reference_size as f64)
    }
}

/// Softmax cross-entropy averaged over every pixel.
fn mean_cross_entropy<B: Backend>(logits: Tensor<B, 4>, labels: Tensor<B, 4>) -> Tensor<B, 1> {
    ops::softmax_cross_entropy_map(logits, labels).mean()
}

/// `1 - (2·I + 1) / (Σp + Σy + 1)`
fn dice_loss<B: Backend>(logits: Tensor<B, 4>, labels: Tensor<B, 4>) -> Tensor<B, 1> {
    let prediction = ops::pixel_wise_softmax(logits);
    let intersection = (prediction.clone() * labels.clone()).sum();
    let coefficient = intersection.mul_scalar(2.0).add_scalar(DICE_SMOOTHING)
        / (prediction.sum() + labels.sum()).add_scalar(DICE_SMOOTHING);
    coefficient.neg().add_scalar(1.0)
}

/// `-(2·I) / (ε + Σp + Σy)`
fn dice_coefficient<B: Backend>(logits: Tensor<B, 4>, labels: Tensor<B, 4>) -> Tensor<B, 1> {
    let prediction = ops::pixel_wise_softmax(logits);
    let intersection = (prediction.clone() * labels.clone()).sum();
    let union = (prediction.sum() + labels.sum()).add_scalar(DICE_EPSILON);
    (intersection.mul_scalar(2.0) / union).neg()
}

/// Mean of `|∇y| - |∇l|` over Sobel gradient magnitudes. Kept in its historical signed
/// form: it is not a distance and can go negative.
fn edge_magnitude_difference<B: Backend>(
    labels: Tensor<B, 4>,
    logits: Tensor<B, 4>,
) -> Tensor<B, 1> {
    let magnitude = |x: Tensor<B, 4>| {
        let (dy, dx) = ops::sobel_edges(x);
        (dy.powf_scalar(2.0) + dx.powf_scalar(2.0)).sqrt()
    };
    (magnitude(labels) - magnitude(logits)).mean()
}

/// Smallest box padded by two pixels on every side. Empty for dummy boxes and for
/// boxes whose padding would start before the image edge.
fn nested_region(region: &RegionBox, height: usize, width: usize) -> (Range<usize>, Range<usize>) {
    if region.is_empty() || region.sx_min < 2 || region.sy_min < 2 {
        return (0..0, 0..0);
    }
    (
        clamped_span(region.sx_min - 2, region.sx_max + 2, height),
        clamped_span(region.sy_min - 2, region.sy_max + 2, width),
    )
}

fn full_sum<B: Backend>(map: &Tensor<B, 4>, sample: usize) -> Tensor<B, 1> {
    let [_, height, width, channels] = map.dims();
    map.clone()
        .slice([sample..sample + 1, 0..height, 0..width, 0..channels])
        .sum()
}

/// Sum of the per-pixel map over a window; `None` when the window is empty.
fn region_sum<B: Backend>(
    map: &Tensor<B, 4>,
    sample: usize,
    rows: Range<usize>,
    cols: Range<usize>,
) -> Option<Tensor<B, 1>> {
    if rows.is_empty() || cols.is_empty() {
        return None;
    }
    let channels = map.dims()[3];
    Some(map.clone().slice([sample..sample + 1, rows, cols, 0..channels]).sum())
}

fn region_mean<B: Backend>(
    map: &Tensor<B, 4>,
    sample: usize,
    rows: Range<usize>,
    cols: Range<usize>,
) -> Option<Tensor<B, 1>> {
    let count = rows.len() * cols.len();
    region_sum(map, sample, rows, cols).map(|sum| sum.div_scalar(count as f64))
}

fn subtract<B: Backend>(total: Tensor<B, 1>, term: Option<Tensor<B, 1>>) -> Tensor<B, 1> {
    match term {
        Some(term) => total - term,
        None => total,
    }
}

fn add_weighted<B: Backend>(
    total: Tensor<B, 1>,
    term: Option<Tensor<B, 1>>,
    weight: f64,
) -> Tensor<B, 1> {
    match term {
        Some(term) => total + term.mul_scalar(weight),
        None => total,
    }
}

fn sum_terms<B: Backend>(
    terms: impl Iterator<Item = Tensor<B, 1>>,
    device: &B::Device,
) -> Tensor<B, 1> {
    terms.fold(Tensor::zeros([1], device), |acc, term| acc + term)
}
