//! Parallel query passes over worker stages.
//!
//! Match batches are split round-robin into one partition per stage. The
//! calling thread's partition writes to the main stage, every other
//! partition to its own worker stage. Worker stages are merged in stage
//! order once all partitions are done, so the result does not depend on
//! thread scheduling.

use parking_lot::Mutex;
use rayon::iter::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};
use smallvec::SmallVec;

use crate::{
    World,
    query::{CompiledQuery, DetachedBatch, Iter, QueryIter},
    stage::Stage,
    table::TableId,
};

impl CompiledQuery {
    /// Run `f` for every batch, spread over the world's worker stages.
    ///
    /// Commands issued through [`Iter::commands`] are applied after all
    /// batches ran: main stage first, then the worker stages in order.
    /// With no worker stages this is [`CompiledQuery::run`].
    pub fn par_run(&self, world: &mut World, f: impl Fn(&mut Iter<'_>) + Send + Sync) {
        if world.stage_count() == 0 {
            self.run(world, |it| f(it));
            return;
        }
        world.defer_begin();
        {
            let world: &World = world;
            let batches = self.batches(world);
            let tables: SmallVec<[TableId; 8]> = batches.iter().filter_map(|b| b.table).fold(
                SmallVec::new(),
                |mut tables, t| {
                    if !tables.contains(&t) {
                        tables.push(t);
                    }
                    tables
                },
            );
            for &t in &tables {
                if let Some(table) = world.tables.get(t) {
                    table.lock();
                }
            }

            let stages = world.stage_count() + 1;
            let mut partitions: Vec<Vec<DetachedBatch>> = (0..stages).map(|_| Vec::new()).collect();
            for (i, batch) in batches.into_iter().enumerate() {
                partitions[i % stages].push(batch);
            }
            tracing::trace!(stages, "running parallel query pass");

            partitions
                .into_par_iter()
                .enumerate()
                .for_each(|(index, partition)| {
                    let stage: &Mutex<Stage> = match index {
                        0 => &world.stage,
                        i => &world.workers[i - 1],
                    };
                    for batch in partition {
                        let mut it = Iter::new(
                            world,
                            stage,
                            self,
                            batch.table,
                            batch.offset,
                            batch.count,
                            &batch.fields,
                            &batch.vars,
                        )
                        .writable(true);
                        f(&mut it);
                    }
                });

            for &t in &tables {
                if let Some(table) = world.tables.get(t) {
                    table.unlock();
                }
            }
        }
        world.defer_end();
        world.merge_workers();
    }

    fn batches(&self, world: &World) -> Vec<DetachedBatch> {
        let mut iter = QueryIter::new(world, self);
        std::iter::from_fn(|| iter.next_detached()).collect()
    }
}
