#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Automated DR correlation: find which lines share an energy level by pumping one line while
//! measuring another, using linkage trees to decide which pair to test next.

mod matrix;
mod tree;

pub use matrix::CompletionMatrix;
pub use tree::{LinkageForest, LinkageNode, NodeId};

use tracing::{debug, info, warn};

use crate::batch::report::{BatchReport, LinkRecord, ScanRecord};
use crate::batch::{BatchPlan, MeasurementResult, ScanDescriptor};

#[derive(Debug, Clone, PartialEq)]
pub struct AmdorConfig {
    /// A pair is linked when the DR intensity falls below this fraction of the reference.
    pub threshold: f64,
    /// Pairs closer than this are not tested.
    pub exclude_range_mhz: f64,
    pub dr_min_mhz: f64,
    pub dr_max_mhz: f64,
    /// Children a node may collect before the search descends. 0 turns tree search off.
    pub max_children: usize,
    /// Scans between forced calibrations.
    pub cal_interval: usize,
}

impl Default for AmdorConfig {
    fn default() -> Self {
        AmdorConfig {
            threshold: 0.5,
            exclude_range_mhz: 1.0,
            dr_min_mhz: 0.0,
            dr_max_mhz: 1.0e6,
            max_children: 3,
            cal_interval: 20,
        }
    }
}

/// One candidate line.
#[derive(Debug, Clone, PartialEq)]
pub struct AmdorLine {
    pub freq_mhz: f64,
    /// Scan used to measure the line; its FT frequency is forced to `freq_mhz`.
    pub template: ScanDescriptor,
    /// Outside the FT range: can be pumped but not measured.
    pub dr_only: bool,
}

impl AmdorLine {
    #[must_use]
    pub fn new(freq_mhz: f64, template: ScanDescriptor) -> Self {
        AmdorLine {
            freq_mhz,
            template: template.with_ft_freq(freq_mhz),
            dr_only: false,
        }
    }

    #[must_use]
    pub fn dr_only(freq_mhz: f64) -> Self {
        AmdorLine {
            freq_mhz,
            template: ScanDescriptor::default(),
            dr_only: true,
        }
    }
}

/// A pair found to be linked.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Linkage {
    pub ft_index: usize,
    pub dr_index: usize,
    pub reference_intensity: f64,
    pub dr_intensity: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Planned {
    Calibration,
    Reference(usize),
    Dr(usize, usize),
}

#[derive(Debug)]
pub struct AmdorBatch {
    config: AmdorConfig,
    lines: Vec<AmdorLine>,
    cal_template: Option<ScanDescriptor>,
    matrix: CompletionMatrix,
    forest: LinkageForest,
    current: Option<NodeId>,

    ft: usize,
    dr: usize,
    reference: Option<(usize, f64)>,
    tuned_line: Option<usize>,
    cal_pending: bool,
    scans_since_cal: usize,
    last: Option<(Planned, ScanDescriptor)>,

    linkages: Vec<Linkage>,
    records: Vec<ScanRecord>,
}

impl AmdorBatch {
    /// Set up the planner. DR-only lines are moved after the measurable ones and `links` (known
    /// linked pairs, indexed into `lines` as given) are marked done.
    #[must_use]
    pub fn new(
        config: AmdorConfig,
        lines: Vec<AmdorLine>,
        links: &[(usize, usize)],
        cal_template: Option<ScanDescriptor>,
    ) -> Self {
        let mut order: Vec<usize> = (0..lines.len()).collect();
        order.sort_by_key(|&k| lines[k].dr_only);
        let mut remap = vec![0; lines.len()];
        for (new, &old) in order.iter().enumerate() {
            remap[old] = new;
        }
        let mut slots: Vec<Option<AmdorLine>> = lines.into_iter().map(Some).collect();
        let lines: Vec<AmdorLine> = order.iter().filter_map(|&k| slots[k].take()).collect();

        let n = lines.len();
        let mut matrix = CompletionMatrix::new(n);
        for i in 0..n {
            if lines[i].dr_only {
                matrix.complete_row(i);
                continue;
            }
            for j in i + 1..n {
                let f_dr = lines[j].freq_mhz;
                if (lines[i].freq_mhz - f_dr).abs() < config.exclude_range_mhz
                    || f_dr < config.dr_min_mhz
                    || f_dr > config.dr_max_mhz
                {
                    matrix.set(i, j);
                }
            }
        }

        let mut forest = LinkageForest::new();
        for &(a, b) in links {
            let (Some(&a), Some(&b)) = (remap.get(a), remap.get(b)) else {
                warn!("ignoring known link ({a}, {b}): no such line");
                continue;
            };
            let (i, j) = (a.min(b), a.max(b));
            matrix.set(i, j);
            if config.max_children > 0 {
                let known = forest
                    .completed()
                    .to_vec()
                    .into_iter()
                    .any(|root| forest.add_child_to_tree(root, i, j));
                if !known {
                    let root = forest.new_tree(i);
                    forest.attach(root, j);
                    forest.complete(root);
                }
            }
        }

        let mut batch = AmdorBatch {
            config,
            lines,
            cal_template: cal_template.map(ScanDescriptor::as_calibration),
            matrix,
            forest,
            current: None,
            ft: 0,
            dr: 0,
            reference: None,
            tuned_line: None,
            cal_pending: false,
            scans_since_cal: 0,
            last: None,
            linkages: Vec::new(),
            records: Vec::new(),
        };
        batch.increment_indices();
        info!(
            "AMDOR batch: {} lines, {} of {} pairs to test",
            n,
            batch.matrix.pair_count() - batch.matrix.completed_pairs(),
            batch.matrix.pair_count()
        );
        batch
    }

    #[inline]
    #[must_use]
    pub fn matrix(&self) -> &CompletionMatrix {
        &self.matrix
    }

    #[inline]
    #[must_use]
    pub fn forest(&self) -> &LinkageForest {
        &self.forest
    }

    #[inline]
    #[must_use]
    pub fn current_node(&self) -> Option<NodeId> {
        self.current
    }

    #[inline]
    #[must_use]
    pub fn lines(&self) -> &[AmdorLine] {
        &self.lines
    }

    #[inline]
    #[must_use]
    pub fn linkages(&self) -> &[Linkage] {
        &self.linkages
    }

    /// The pair the next scan will measure: `(i, i)` is the reference scan of line `i`.
    #[inline]
    #[must_use]
    pub fn position(&self) -> (usize, usize) {
        (self.ft, self.dr)
    }

    #[inline]
    #[must_use]
    pub fn calibration_pending(&self) -> bool {
        self.cal_pending
    }

    #[inline]
    fn tree_mode(&self) -> bool {
        self.config.max_children > 0
    }

    /// Move to line `i`, starting with its reference scan unless the reference is still valid.
    fn go_to_row(&mut self, i: usize) {
        match (self.reference, self.matrix.first_untested_in_row(i)) {
            (Some((row, _)), Some(j)) if row == i && self.ft == i => self.dr = j,
            _ => {
                self.ft = i;
                self.dr = i;
            }
        }
    }

    /// Row-major resume: the first untested pair in the matrix.
    fn increment_indices(&mut self) {
        if let Some((i, _)) = self.matrix.first_untested() {
            self.go_to_row(i);
        }
    }

    fn resume_from_branch(&mut self) {
        self.current = None;
        self.increment_indices();
    }

    /// Depth-first step from the current node: descend into the first child with untested
    /// pairs, else climb. A fully explored tree is archived.
    fn next_tree_branch(&mut self) {
        self.maybe_schedule_calibration();
        while let Some(id) = self.current {
            let node = self.forest.node(id);
            let (parent, line) = (node.parent, node.line);
            let next = node
                .children
                .iter()
                .map(|&c| (c, self.forest.node(c).line))
                .find(|&(_, l)| self.matrix.first_untested_in_row(l).is_some());
            if let Some((child, child_line)) = next {
                debug!("descending to line {child_line}");
                self.current = Some(child);
                self.go_to_row(child_line);
                return;
            }
            if let Some(parent) = parent {
                self.current = Some(parent);
            } else {
                debug!("tree rooted at line {line} explored");
                self.forest.complete(id);
                self.current = None;
            }
        }
        self.increment_indices();
    }

    fn row_exhausted(&mut self) {
        if self.current.is_some() {
            self.next_tree_branch();
        } else {
            self.maybe_schedule_calibration();
            self.increment_indices();
        }
    }

    fn continue_row(&mut self) {
        match self.matrix.first_untested_in_row(self.ft) {
            Some(j) => self.dr = j,
            None => self.row_exhausted(),
        }
    }

    fn maybe_schedule_calibration(&mut self) {
        if self.cal_template.is_some() && self.scans_since_cal >= self.config.cal_interval {
            self.cal_pending = true;
        }
    }

    /// Record a linked pair in the trees. Returns false when the active exploration was
    /// abandoned because the pair already belongs to a finished tree.
    fn record_in_tree(&mut self, i: usize, j: usize) -> bool {
        let roots = self.forest.completed().to_vec();
        if roots
            .into_iter()
            .any(|root| self.forest.add_child_to_tree(root, i, j))
        {
            if let Some(active) = self.current.take() {
                info!("link {i}-{j} joins a finished tree; abandoning current branch");
                self.forest.complete(active);
            }
            self.resume_from_branch();
            return false;
        }
        match self.current {
            Some(node) => {
                self.forest.attach(node, j);
            }
            None => {
                let root = self.forest.new_tree(i);
                self.forest.attach(root, j);
                self.current = Some(root);
            }
        }
        true
    }

    fn advance_reference(&mut self, i: usize, intensity: f64) {
        if intensity < 0.0 {
            warn!("no signal on line {i} ({:.3} MHz); skipping its row", self.lines[i].freq_mhz);
            self.reference = None;
            self.matrix.complete_row(i);
            self.row_exhausted();
            return;
        }
        self.reference = Some((i, intensity));
        self.continue_row();
    }

    fn advance_dr(&mut self, i: usize, j: usize, intensity: f64) {
        self.matrix.set(i, j);
        let reference = match self.reference {
            Some((row, value)) if row == i => value,
            _ => {
                warn!("DR result for {i}-{j} without a reference");
                self.continue_row();
                return;
            }
        };
        if intensity < self.config.threshold * reference {
            info!("lines {i} and {j} are linked ({intensity:.3} vs {reference:.3})");
            self.linkages.push(Linkage {
                ft_index: i,
                dr_index: j,
                reference_intensity: reference,
                dr_intensity: intensity,
            });
            if self.tree_mode() {
                if !self.record_in_tree(i, j) {
                    return;
                }
                if let Some(node) = self.current {
                    if self.forest.node(node).children.len() >= self.config.max_children {
                        self.next_tree_branch();
                        return;
                    }
                }
            }
        }
        self.continue_row();
    }

    fn scan_for(&self, planned: Planned) -> ScanDescriptor {
        match planned {
            Planned::Calibration => self.cal_template.clone().unwrap_or_default(),
            Planned::Reference(i) => self.lines[i]
                .template
                .clone()
                .without_dr()
                .with_skip_tune(self.tuned_line == Some(i)),
            Planned::Dr(i, j) => self.lines[i]
                .template
                .clone()
                .with_dr(self.lines[j].freq_mhz)
                .with_skip_tune(self.tuned_line == Some(i)),
        }
    }

    fn label(planned: Planned) -> String {
        match planned {
            Planned::Calibration => "cal".to_string(),
            Planned::Reference(i) => format!("ref {i}"),
            Planned::Dr(i, j) => format!("dr {i}-{j}"),
        }
    }
}

impl BatchPlan for AmdorBatch {
    fn kind(&self) -> &'static str {
        "amdor"
    }

    fn prepare_next_scan(&mut self) -> ScanDescriptor {
        let planned = if self.cal_pending {
            Planned::Calibration
        } else if self.ft == self.dr {
            Planned::Reference(self.ft)
        } else {
            Planned::Dr(self.ft, self.dr)
        };
        let scan = self.scan_for(planned);
        self.last = Some((planned, scan.clone()));
        scan
    }

    fn advance(&mut self, result: &MeasurementResult) {
        let Some((planned, _)) = self.last else {
            return;
        };
        if result.bad_tune {
            warn!("scan {} tuned poorly", result.scan_number);
        }
        match planned {
            Planned::Calibration => {
                self.cal_pending = false;
                self.scans_since_cal = 0;
                self.tuned_line = None;
            }
            Planned::Reference(i) => {
                self.scans_since_cal += 1;
                self.tuned_line = Some(i);
                self.advance_reference(i, result.intensity);
            }
            Planned::Dr(i, j) => {
                self.scans_since_cal += 1;
                self.tuned_line = Some(i);
                self.advance_dr(i, j, result.intensity);
            }
        }
    }

    fn process_result(&mut self, result: &MeasurementResult) {
        if let Some((planned, scan)) = &self.last {
            self.records
                .push(ScanRecord::new(Self::label(*planned), scan, result));
        }
    }

    fn is_complete(&self) -> bool {
        self.matrix.is_complete() && !self.cal_pending
    }

    #[allow(clippy::cast_precision_loss)]
    fn progress(&self) -> f64 {
        if self.is_complete() || self.matrix.pair_count() == 0 {
            return 1.0;
        }
        self.matrix.completed_pairs() as f64 / self.matrix.pair_count() as f64
    }

    fn report(&self) -> BatchReport {
        let mut report = BatchReport::new(self.kind(), self.is_complete())
            .with_header("threshold", self.config.threshold)
            .with_header("exclude_range_mhz", self.config.exclude_range_mhz)
            .with_header("dr_min_mhz", self.config.dr_min_mhz)
            .with_header("dr_max_mhz", self.config.dr_max_mhz)
            .with_header("max_children", self.config.max_children)
            .with_header("lines", self.lines.len());
        report.scans.clone_from(&self.records);
        report.links = self
            .linkages
            .iter()
            .map(|l| LinkRecord {
                ft_index: l.ft_index,
                dr_index: l.dr_index,
                ft_freq_mhz: self.lines[l.ft_index].freq_mhz,
                dr_freq_mhz: self.lines[l.dr_index].freq_mhz,
                reference_intensity: l.reference_intensity,
                dr_intensity: l.dr_intensity,
            })
            .collect();
        let mut roots = self.forest.completed().to_vec();
        if let Some(active) = self.current {
            roots.push(self.forest.root_of(active));
        }
        report.trees = roots.into_iter().map(|r| self.forest.lines(r)).collect();
        report
    }
}
