// ========================================================================================
//                               Stochastic Setwork Search
// ========================================================================================
//
// Each trial samples features from three marker pools, enumerates every union,
// intersection and difference combination of the sample, scores the cartesian product
// against the phenotype, and folds the survivors into an arena. Every
// `repopulate_frequency` trials the best records are fed back into the pools, and
// after each trial larger setworks that do not beat their smaller relatives by enough
// are ejected as passengers.

use crate::adjust::adjust;
use crate::algebra::assemble;
use crate::combine::{MarkerPool, combine_features, weighted_sample};
use crate::config::{ConfigError, RankMethod, SearchConfig};
use crate::passenger::find_passengers;
use crate::priors::ResolvedPriors;
use crate::progress::{NoopSearchProgress, SearchProgressObserver, SearchProgressStage};
use crate::stats::{ContingencyTable, EffectSize, LogFactorials, Performance, evaluate};
use crate::store::FeatureStore;
use crate::types::{
    Barcode, FeatureId, Interaction, NamedSetwork, SetOperation, Setwork, Variate,
    base_feature_name,
};
use ahash::{AHashMap, AHashSet};
use itertools::iproduct;
use ndarray::{Array1, ArrayView1};
use rand::Rng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use std::collections::BTreeMap;

/// Everything computed for one scored setwork.
#[derive(Clone, Debug, PartialEq)]
pub struct SignificanceRecord {
    pub setwork: Setwork,
    pub p_value: f64,
    pub interaction: Interaction,
    pub table: ContingencyTable,
    pub performance: Performance,
    pub effect_size: EffectSize,
}

impl SignificanceRecord {
    pub fn sample_count(&self) -> u64 {
        self.table.total()
    }

    pub fn case_count(&self) -> u64 {
        self.table.cases()
    }
}

/// Records of one search keyed by barcode. A setwork whose contents are already held
/// reuses the existing barcode instead of creating a second record.
#[derive(Debug, Default)]
pub struct SetworkArena {
    records: BTreeMap<Barcode, SignificanceRecord>,
    by_content: AHashMap<Setwork, Barcode>,
    next_barcode: u64,
}

impl SetworkArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: SignificanceRecord) -> Barcode {
        self.insert_tracked(record).0
    }

    /// Like [`SetworkArena::insert`], also reporting whether the record is new to the
    /// arena.
    pub fn insert_tracked(&mut self, record: SignificanceRecord) -> (Barcode, bool) {
        if let Some(&existing) = self.by_content.get(&record.setwork) {
            return (existing, false);
        }
        let barcode = Barcode(self.next_barcode);
        self.next_barcode += 1;
        self.by_content.insert(record.setwork.clone(), barcode);
        self.records.insert(barcode, record);
        (barcode, true)
    }

    pub fn remove(&mut self, barcode: Barcode) -> Option<SignificanceRecord> {
        let record = self.records.remove(&barcode)?;
        self.by_content.remove(&record.setwork);
        Some(record)
    }

    pub fn get(&self, barcode: Barcode) -> Option<&SignificanceRecord> {
        self.records.get(&barcode)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Barcode, &SignificanceRecord)> {
        self.records.iter().map(|(&b, r)| (b, r))
    }
}

/// Barcodes of the `top` best records under `method`. Equal scores keep barcode order.
pub fn rank(arena: &SetworkArena, method: RankMethod, top: usize) -> Vec<Barcode> {
    let mut scored: Vec<(Barcode, &Performance)> =
        arena.iter().map(|(b, r)| (b, &r.performance)).collect();
    scored.sort_by(|a, b| method.compare(a.1, b.1).then(a.0.cmp(&b.0)));
    scored.into_iter().take(top).map(|(b, _)| b).collect()
}

/// Base feature name of every feature in a store, interned to small integers so that
/// repeat checks compare integers instead of strings.
#[derive(Debug, Clone)]
pub struct BaseNames {
    ids: Vec<u32>,
}

impl BaseNames {
    pub fn new(store: &FeatureStore) -> Self {
        let mut interned: AHashMap<&str, u32> = AHashMap::new();
        let ids = store
            .features()
            .iter()
            .map(|key| {
                let next = interned.len() as u32;
                *interned.entry(base_feature_name(key)).or_insert(next)
            })
            .collect();
        Self { ids }
    }

    #[inline]
    pub fn of(&self, feature: FeatureId) -> u32 {
        self.ids[feature.0]
    }

    /// True when two features of the setwork share a base name.
    pub fn has_repeat(&self, setwork: &Setwork) -> bool {
        let mut seen: Vec<u32> = setwork.features().map(|f| self.of(f)).collect();
        let total = seen.len();
        seen.sort_unstable();
        seen.dedup();
        seen.len() != total
    }

    /// True when the two setworks have at least one base name in common.
    pub fn overlap(&self, a: &Setwork, b: &Setwork) -> bool {
        let names: Vec<u32> = a.features().map(|f| self.of(f)).collect();
        b.features().any(|f| names.contains(&self.of(f)))
    }
}

/// A record that survived correction and the performance gates.
#[derive(Clone, Debug, PartialEq)]
pub struct RetainedSetwork {
    pub barcode: Barcode,
    pub record: SignificanceRecord,
    pub q_value: f64,
}

#[derive(Clone, Debug)]
pub struct SearchOutcome {
    pub phenotype: FeatureId,
    pub retained: Vec<RetainedSetwork>,
    /// Distinct setworks held in the arena when the trials ended.
    pub records_held: usize,
    /// Smallest surviving q-value when the phenotype was permuted.
    pub permutation_min_q: Option<f64>,
}

impl SearchOutcome {
    pub fn is_empty(&self) -> bool {
        self.retained.is_empty()
    }
}

/// One configured search over a feature store.
pub struct Search<'a> {
    store: &'a FeatureStore,
    config: &'a SearchConfig,
    priors: Option<ResolvedPriors>,
    base_names: BaseNames,
    factorials: LogFactorials,
}

impl<'a> Search<'a> {
    /// Validates the configuration against the store. Nothing here depends on which
    /// phenotype is searched.
    pub fn new(store: &'a FeatureStore, config: &'a SearchConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        if store.markers().is_empty() {
            return Err(ConfigError::NoMarkers);
        }
        let priors = config
            .priors
            .as_ref()
            .map(|p| ResolvedPriors::resolve(p, store))
            .transpose()?;
        Ok(Self {
            store,
            config,
            priors,
            base_names: BaseNames::new(store),
            factorials: LogFactorials::new(store.n_labels()),
        })
    }

    pub fn store(&self) -> &FeatureStore {
        self.store
    }

    pub fn config(&self) -> &SearchConfig {
        self.config
    }

    pub fn base_names(&self) -> &BaseNames {
        &self.base_names
    }

    pub fn named(&self, setwork: &Setwork) -> NamedSetwork {
        let names = |ids: &[FeatureId]| -> Vec<String> {
            ids.iter().map(|&id| self.store.feature_name(id).to_string()).collect()
        };
        NamedSetwork {
            union: names(&setwork.union),
            intersection: names(&setwork.intersection),
            difference: names(&setwork.difference),
        }
    }

    pub fn run<R: Rng + ?Sized>(&self, phenotype: FeatureId, rng: &mut R) -> SearchOutcome {
        self.run_with_observer(phenotype, rng, &mut NoopSearchProgress)
    }

    pub fn run_with_observer<R, O>(
        &self,
        phenotype: FeatureId,
        rng: &mut R,
        observer: &mut O,
    ) -> SearchOutcome
    where
        R: Rng + ?Sized,
        O: SearchProgressObserver + ?Sized,
    {
        let config = self.config;
        let opt = &config.optimization;
        let phenotype_name = self.store.feature_name(phenotype);

        let mut response: Vec<Variate> = self.store.row(phenotype).to_vec();
        if config.permute_phenotype {
            response.shuffle(rng);
            log::info!("Phenotype '{phenotype_name}' permuted for a null search");
        }
        let response = Array1::from(response);

        let markers: Vec<FeatureId> = self
            .store
            .markers()
            .iter()
            .copied()
            .filter(|&m| m != phenotype)
            .collect();
        let mut pools = [
            MarkerPool::new(&markers),
            MarkerPool::new(&markers),
            MarkerPool::new(&markers),
        ];
        let mut arena = SetworkArena::new();
        let mut ejected_total = 0usize;

        log::info!(
            "Searching setworks for '{}': {} trials, {} markers, set limits {}/{}/{}",
            phenotype_name,
            opt.trials,
            markers.len(),
            config.set_limits.union,
            config.set_limits.intersection,
            config.set_limits.difference
        );
        observer.on_stage_start(SearchProgressStage::Trials, opt.trials);

        for trial in 0..opt.trials {
            if trial > 0 && trial % opt.repopulate_frequency == 0 {
                self.repopulate(&arena, &mut pools);
            }

            let mut combinations: [Vec<Vec<FeatureId>>; 3] = Default::default();
            for op in SetOperation::ALL {
                let pool = &pools[op.index()];
                let k = config.set_limits.limit(op).min(pool.len());
                let sampled = weighted_sample(pool.entries(), k, rng);
                combinations[op.index()] = combine_features(&sampled, 0, sampled.len());
            }
            if let Some(priors) = &self.priors {
                priors.inject(&mut combinations, rng);
            }

            let [unions, intersections, differences] = &combinations;
            let candidates: Vec<Setwork> = iproduct!(unions, intersections, differences)
                .map(|(u, i, d)| Setwork::new(u.clone(), i.clone(), d.clone()))
                .collect();

            let scored: Vec<SignificanceRecord> = candidates
                .into_par_iter()
                .filter_map(|setwork| self.score(setwork, response.view()))
                .collect();

            if scored.is_empty() {
                log::debug!("Trial {trial} produced no valid setworks");
            }
            ejected_total += self.record_trial(&mut arena, scored);

            observer.on_trial_finish(trial + 1, arena.len());
        }
        observer.on_stage_finish(SearchProgressStage::Trials);

        if config.eject_fraction.is_some() {
            log::debug!("Ejected {ejected_total} passenger setworks for '{phenotype_name}'");
        }

        observer.on_stage_start(SearchProgressStage::Correction, arena.len());
        let retained = self.filter(&arena);
        observer.on_stage_finish(SearchProgressStage::Correction);

        log::info!(
            "'{}': {} of {} distinct setworks pass {} at FDR {}",
            phenotype_name,
            retained.len(),
            arena.len(),
            config.correction,
            config.fdr
        );

        let permutation_min_q = if config.permute_phenotype {
            let min_q = retained.iter().map(|r| r.q_value).reduce(f64::min);
            match min_q {
                Some(q) => log::warn!(
                    "Permuted phenotype '{phenotype_name}' still yields {} setworks (smallest q-value {q:.3e}); the FDR threshold is too permissive for this data",
                    retained.len()
                ),
                None => log::info!("Permuted phenotype '{phenotype_name}' yields no significant setworks"),
            }
            min_q
        } else {
            None
        };

        SearchOutcome {
            phenotype,
            retained,
            records_held: arena.len(),
            permutation_min_q,
        }
    }

    /// Adds one trial's records to the arena and ejects its passengers. Only records
    /// this trial created can be ejected; a rediscovered setwork takes part in the
    /// comparison but keeps the record an earlier trial left. Returns the number ejected.
    fn record_trial(&self, arena: &mut SetworkArena, scored: Vec<SignificanceRecord>) -> usize {
        let mut local: Vec<Barcode> = Vec::with_capacity(scored.len());
        let mut created: AHashSet<Barcode> = AHashSet::with_capacity(scored.len());
        for record in scored {
            let (barcode, is_new) = arena.insert_tracked(record);
            local.push(barcode);
            if is_new {
                created.insert(barcode);
            }
        }
        local.sort_unstable();
        local.dedup();

        let Some(fraction) = self.config.eject_fraction else {
            return 0;
        };
        let passengers = find_passengers(&local, arena, &self.base_names, fraction);
        let mut ejected = 0;
        for barcode in passengers.into_iter().filter(|b| created.contains(b)) {
            arena.remove(barcode);
            ejected += 1;
        }
        ejected
    }

    /// Feeds the features of the best records back into the pool of the operation
    /// they were used in.
    fn repopulate(&self, arena: &SetworkArena, pools: &mut [MarkerPool; 3]) {
        let top = (arena.len() as f64 * self.config.optimization.percent_to_repopulate) as usize;
        let best = rank(arena, self.config.rank_method, top);
        for barcode in &best {
            if let Some(record) = arena.get(*barcode) {
                for op in SetOperation::ALL {
                    pools[op.index()].extend(record.setwork.operation(op).iter().copied());
                }
            }
        }
        log::debug!(
            "Repopulated marker pools from {} of {} records (pool sizes {}/{}/{})",
            best.len(),
            arena.len(),
            pools[0].len(),
            pools[1].len(),
            pools[2].len()
        );
    }

    /// Scores one candidate, or rejects it.
    fn score(
        &self,
        setwork: Setwork,
        response: ArrayView1<'_, Variate>,
    ) -> Option<SignificanceRecord> {
        if !self.config.bandwidth && self.base_names.has_repeat(&setwork) {
            return None;
        }
        let vector = assemble(self.store, &setwork)?;
        let result = evaluate(vector.view(), response, &self.factorials);
        if self.config.force_cooccurring && result.interaction == Interaction::MutuallyExclusive {
            return None;
        }
        Some(SignificanceRecord {
            setwork,
            p_value: result.test.p_value,
            interaction: result.interaction,
            table: result.table,
            performance: result.performance,
            effect_size: result.effect_size,
        })
    }

    /// Corrects every held p-value and keeps the records under the FDR threshold that
    /// also pass the performance gates.
    fn filter(&self, arena: &SetworkArena) -> Vec<RetainedSetwork> {
        let p_values: BTreeMap<Barcode, f64> =
            arena.iter().map(|(b, r)| (b, r.p_value)).collect();
        let q_values = adjust(&p_values, self.config.correction);

        arena
            .iter()
            .filter_map(|(barcode, record)| {
                let q_value = q_values.get(&barcode).copied()?;
                let keep = q_value < self.config.fdr
                    && self.config.minimum_performance.passes(&record.performance);
                keep.then(|| RetainedSetwork {
                    barcode,
                    record: record.clone(),
                    q_value,
                })
            })
            .collect()
    }
}
