use std::collections::HashMap;

use log::trace;

use super::{Feeds, OpHandle, Operation, Session, Tensor, Variables};
use crate::{PolicyErr, Result};

/// An in-process session, every run executes synchronously on the caller's thread.
#[derive(Default)]
pub struct LocalSession {
    vars: Variables,
    ops: HashMap<String, Box<dyn Operation>>,
}

impl LocalSession {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_free(&self, handle: &OpHandle) -> Result<()> {
        if self.contains(handle) {
            return Err(PolicyErr::DuplicateNode {
                name: handle.name().to_string(),
            });
        }

        Ok(())
    }
}

impl Session for LocalSession {
    fn define_variable(&mut self, handle: OpHandle, init: Tensor) -> Result<OpHandle> {
        self.check_free(&handle)?;
        trace!("defining variable {handle} with shape {:?}", init.shape());
        self.vars.insert(&handle, init);
        Ok(handle)
    }

    fn define_op(&mut self, handle: OpHandle, op: Box<dyn Operation>) -> Result<OpHandle> {
        self.check_free(&handle)?;
        trace!("defining op {handle}");
        self.ops.insert(handle.name().to_string(), op);
        Ok(handle)
    }

    fn run(&mut self, fetches: &[&OpHandle], feeds: &Feeds) -> Result<Vec<Tensor>> {
        let Self { vars, ops } = self;
        vars.begin_run();

        fetches
            .iter()
            .map(|handle| match ops.get_mut(handle.name()) {
                Some(op) => op.eval(vars, feeds),
                None => vars.get(handle).cloned(),
            })
            .collect()
    }

    fn contains(&self, handle: &OpHandle) -> bool {
        self.vars.contains(handle) || self.ops.contains_key(handle.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter(sess: &mut LocalSession) -> (OpHandle, OpHandle) {
        let var = sess
            .define_variable(OpHandle::scoped("t", "count"), Tensor::scalar_i64(0))
            .unwrap();

        let target = var.clone();
        let op = move |vars: &mut Variables, _: &Feeds| -> Result<Tensor> {
            let count = vars.get_mut(&target)?.as_i64_mut(target.name())?;
            count.mapv_inplace(|c| c + 1);
            Ok(Tensor::I64(count.clone()))
        };

        let inc = sess
            .define_op(OpHandle::scoped("t", "inc"), Box::new(op))
            .unwrap();

        (var, inc)
    }

    #[test]
    fn runs_fetches_in_order() {
        let mut sess = LocalSession::new();
        let (var, inc) = counter(&mut sess);
        let feeds = Feeds::new();

        let out = sess.run(&[&var, &inc, &var], &feeds).unwrap();
        let values: Vec<_> = out.iter().map(|t| t.to_scalar_i64("count").unwrap()).collect();
        assert_eq!(values, vec![0, 1, 1]);
    }

    #[test]
    fn fetches_of_one_run_share_its_id() {
        let mut sess = LocalSession::new();
        let run = |vars: &mut Variables, _: &Feeds| -> Result<Tensor> {
            Ok(Tensor::scalar_i64(vars.run() as i64))
        };
        let op = sess
            .define_op(OpHandle::scoped("t", "run"), Box::new(run))
            .unwrap();

        let feeds = Feeds::new();
        let first = sess.run(&[&op, &op], &feeds).unwrap();
        assert_eq!(first[0], first[1]);

        let second = sess.run(&[&op], &feeds).unwrap();
        let first = first[0].to_scalar_i64("run").unwrap();
        assert!(second[0].to_scalar_i64("run").unwrap() > first);
    }

    #[test]
    fn rejects_duplicates() {
        let mut sess = LocalSession::new();
        counter(&mut sess);

        let res = sess.define_variable(OpHandle::scoped("t", "inc"), Tensor::scalar_i64(0));
        assert!(matches!(res, Err(PolicyErr::DuplicateNode { name }) if name == "t/inc"));
    }

    #[test]
    fn unknown_fetch() {
        let mut sess = LocalSession::new();
        let missing = OpHandle::scoped("t", "missing");
        assert!(!sess.contains(&missing));

        let res = sess.run(&[&missing], &Feeds::new());
        assert!(matches!(res, Err(PolicyErr::UnknownNode { .. })));
    }

    #[test]
    fn ops_read_feeds() {
        let mut sess = LocalSession::new();
        let x = OpHandle::scoped("t", "x");
        let input = x.clone();
        let double = move |_: &mut Variables, feeds: &Feeds| -> Result<Tensor> {
            let v = feeds.get(&input)?.as_f32(input.name())?;
            Ok(Tensor::F32(v * 2.0))
        };
        let op = sess
            .define_op(OpHandle::scoped("t", "double"), Box::new(double))
            .unwrap();

        let mut feeds = Feeds::new();
        feeds.insert(&x, 1.5_f32);
        let out = sess.run(&[&op], &feeds).unwrap();
        assert_eq!(out[0], Tensor::from(3.0_f32));

        let res = sess.run(&[&op], &Feeds::new());
        assert!(matches!(res, Err(PolicyErr::MissingFeed { .. })));
    }
}
