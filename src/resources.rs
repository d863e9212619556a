use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::thread;
use tokio::sync::Notify;

pub type Amounts = BTreeMap<String, usize>;

#[derive(Debug, PartialEq)]
pub enum ResourceError
{
    UnknownResource(String),
    AmountOverTotal
    {
        name : String,
        amount : usize,
        total : usize,
    },
    DefaultOverTotal
    {
        name : String,
        amount : usize,
        total : usize,
    },
}

impl fmt::Display for ResourceError
{
    fn fmt(&self, formatter : &mut fmt::Formatter) -> fmt::Result
    {
        match self
        {
            ResourceError::UnknownResource(name) =>
                write!(formatter, "Requested the unknown resource: {}", name),

            ResourceError::AmountOverTotal{name, amount, total} =>
                write!(formatter, "The requested resource: {} amount: {} \
                    is greater than the total amount: {}", name, amount, total),

            ResourceError::DefaultOverTotal{name, amount, total} =>
                write!(formatter, "The default amount: {} of the resource: {} \
                    is greater than the total amount: {}", amount, name, total),
        }
    }
}

struct PoolState
{
    total : Amounts,
    available : Amounts,
    default : Amounts,
}

/*  Named integer semaphores restricting parallelism.  Actions declare the
    amounts they need and wait until they are available; every release wakes
    all waiters so nobody starves.  The canonical "jobs" resource is always
    present. */
pub struct ResourcePool
{
    state : RefCell<PoolState>,
    condition : Notify,
}

/*  Translate the "jobs" parameter value into a total capacity.  Negative
    means one per that many logical processors; zero means unlimited, which a
    total of zero encodes since uncharged resources are skipped. */
pub fn jobs_from_parameter(jobs : i64) -> usize
{
    let processors = match thread::available_parallelism()
    {
        Ok(count) => count.get(),
        Err(_) => 1,
    };

    if jobs < 0
    {
        let fraction = processors / ((-jobs) as usize);
        if fraction < 1
        {
            1
        }
        else
        {
            fraction
        }
    }
    else
    {
        jobs as usize
    }
}

impl ResourcePool
{
    pub fn new(jobs_total : usize) -> ResourcePool
    {
        let mut total = Amounts::new();
        total.insert("jobs".to_string(), jobs_total);

        let mut default = Amounts::new();
        default.insert("jobs".to_string(), 1);

        ResourcePool
        {
            state : RefCell::new(PoolState
            {
                available : total.clone(),
                total : total,
                default : default,
            }),
            condition : Notify::new(),
        }
    }

    /*  Declare an additional named resource with its total capacity and the
        amount charged to actions that do not name it. */
    pub fn register(&self, name : &str, total : usize, default : usize)
        -> Result<(), ResourceError>
    {
        let mut state = self.state.borrow_mut();
        let total = match state.total.get(name).copied()
        {
            Some(existing) => existing,
            None =>
            {
                state.total.insert(name.to_string(), total);
                state.available.insert(name.to_string(), total);
                total
            },
        };

        if default > total
        {
            return Err(ResourceError::DefaultOverTotal
            {
                name : name.to_string(),
                amount : default,
                total : total,
            });
        }

        state.default.insert(name.to_string(), default);
        Ok(())
    }

    /*  The actual debit for one action: validate what it asked for, drop
        zeros and uncharged resources, and charge defaults for every other
        resource with capacity. */
    pub fn effective(&self, requested : &Amounts) -> Result<Amounts, ResourceError>
    {
        let state = self.state.borrow();
        let mut amounts = Amounts::new();

        for (name, amount) in requested
        {
            let total = match state.total.get(name)
            {
                Some(total) => *total,
                None => return Err(ResourceError::UnknownResource(name.clone())),
            };
            if *amount == 0 || total == 0
            {
                continue;
            }
            if *amount > total
            {
                return Err(ResourceError::AmountOverTotal
                {
                    name : name.clone(),
                    amount : *amount,
                    total : total,
                });
            }
            amounts.insert(name.clone(), *amount);
        }

        for (name, total) in state.total.iter()
        {
            if requested.contains_key(name) || *total == 0
            {
                continue;
            }
            let amount = match state.default.get(name)
            {
                Some(amount) => *amount,
                None => 0,
            };
            if amount == 0
            {
                continue;
            }
            amounts.insert(name.clone(), amount);
        }

        Ok(amounts)
    }

    fn have(&self, amounts : &Amounts) -> bool
    {
        let state = self.state.borrow();
        for (name, amount) in amounts
        {
            match state.available.get(name)
            {
                Some(available) if amount <= available => {},
                _ => return false,
            }
        }
        true
    }

    fn grab(&self, amounts : &Amounts)
    {
        let mut state = self.state.borrow_mut();
        for (name, amount) in amounts
        {
            if let Some(available) = state.available.get_mut(name)
            {
                *available -= amount;
            }
        }
    }

    /*  Wait until every requested amount is available, then take them.  The
        caller is responsible for the matching free. */
    pub async fn use_resources(&self, amounts : &Amounts)
    {
        loop
        {
            if self.have(amounts)
            {
                self.grab(amounts);
                return;
            }
            self.condition.notified().await;
        }
    }

    /*  Release amounts and wake every waiter to re-check. */
    pub fn free(&self, amounts : &Amounts)
    {
        {
            let mut state = self.state.borrow_mut();
            for (name, amount) in amounts
            {
                if let Some(available) = state.available.get_mut(name)
                {
                    *available += amount;
                }
            }
        }
        self.condition.notify_waiters();
    }

    pub fn describe_available(&self) -> String
    {
        amounts_to_string(&self.state.borrow().available)
    }

    #[cfg(test)]
    pub fn available(&self, name : &str) -> usize
    {
        match self.state.borrow().available.get(name)
        {
            Some(amount) => *amount,
            None => 0,
        }
    }
}

pub fn amounts_to_string(amounts : &Amounts) -> String
{
    amounts
        .iter()
        .map(|(name, amount)| format!("{}={}", name, amount))
        .collect::<Vec<String>>()
        .join(",")
}

#[cfg(test)]
mod tests
{
    use crate::resources::
    {
        Amounts,
        amounts_to_string,
        jobs_from_parameter,
        ResourceError,
        ResourcePool,
    };
    use std::cell::RefCell;
    use std::rc::Rc;

    fn amounts(pairs : &[(&str, usize)]) -> Amounts
    {
        let mut result = Amounts::new();
        for (name, amount) in pairs
        {
            result.insert(name.to_string(), *amount);
        }
        result
    }

    #[test]
    fn effective_fills_in_defaults()
    {
        let pool = ResourcePool::new(4);
        let effective = pool.effective(&Amounts::new()).unwrap();
        assert_eq!(effective, amounts(&[("jobs", 1)]));

        let effective = pool.effective(&amounts(&[("jobs", 3)])).unwrap();
        assert_eq!(effective, amounts(&[("jobs", 3)]));
    }

    #[test]
    fn effective_drops_zero_and_uncharged()
    {
        let pool = ResourcePool::new(4);
        let effective = pool.effective(&amounts(&[("jobs", 0)])).unwrap();
        assert_eq!(effective, Amounts::new());

        let unlimited = ResourcePool::new(0);
        let effective = unlimited.effective(&amounts(&[("jobs", 2)])).unwrap();
        assert_eq!(effective, Amounts::new());
    }

    #[test]
    fn effective_rejects_unknown_and_over_total()
    {
        let pool = ResourcePool::new(4);
        assert_eq!(
            pool.effective(&amounts(&[("ram", 1)])),
            Err(ResourceError::UnknownResource("ram".to_string())));
        assert_eq!(
            pool.effective(&amounts(&[("jobs", 5)])),
            Err(ResourceError::AmountOverTotal
            {
                name : "jobs".to_string(),
                amount : 5,
                total : 4,
            }));
    }

    #[test]
    fn registered_resources_charge_defaults()
    {
        let pool = ResourcePool::new(4);
        pool.register("ram", 64, 8).unwrap();

        let effective = pool.effective(&Amounts::new()).unwrap();
        assert_eq!(effective, amounts(&[("jobs", 1), ("ram", 8)]));

        let effective = pool.effective(&amounts(&[("ram", 32)])).unwrap();
        assert_eq!(effective, amounts(&[("jobs", 1), ("ram", 32)]));

        assert_eq!(
            pool.register("disk", 2, 3),
            Err(ResourceError::DefaultOverTotal
            {
                name : "disk".to_string(),
                amount : 3,
                total : 2,
            }));
    }

    #[test]
    fn jobs_parameter_translates_to_capacity()
    {
        assert_eq!(jobs_from_parameter(3), 3);
        assert_eq!(jobs_from_parameter(0), 0);
        assert!(jobs_from_parameter(-1) >= 1);
        assert_eq!(jobs_from_parameter(-1_000_000), 1);
    }

    #[test]
    fn waiters_serialize_on_capacity()
    {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let local = tokio::task::LocalSet::new();

        runtime.block_on(local.run_until(async
        {
            let pool = Rc::new(ResourcePool::new(2));
            let order = Rc::new(RefCell::new(vec![]));

            let mut tasks = vec![];
            for index in 0..2
            {
                let pool = pool.clone();
                let order = order.clone();
                tasks.push(tokio::task::spawn_local(async move
                {
                    let wanted = amounts(&[("jobs", 2)]);
                    pool.use_resources(&wanted).await;
                    order.borrow_mut().push(format!("grab {}", index));
                    tokio::task::yield_now().await;
                    order.borrow_mut().push(format!("free {}", index));
                    pool.free(&wanted);
                }));
            }

            for task in tasks
            {
                task.await.unwrap();
            }

            /*  Each grab completes before the other may start. */
            let order = order.borrow();
            assert_eq!(order.len(), 4);
            assert_eq!(order[0].replace("grab ", "free "), order[1]);
            assert_eq!(order[2].replace("grab ", "free "), order[3]);
            assert_eq!(pool.available("jobs"), 2);
        }));
    }

    #[test]
    fn amounts_render_sorted()
    {
        assert_eq!(
            amounts_to_string(&amounts(&[("ram", 8), ("jobs", 1)])),
            "jobs=1,ram=8");
    }
}
