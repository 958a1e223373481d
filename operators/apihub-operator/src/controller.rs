//! 控制器模块
//!
//! 该模块实现了 ApiHub Operator 的核心控制器：持有资源存储、网关客户端、
//! 分布式写锁与领导者选举，启动每类资源的事件处理器与周期同步任务，
//! 并负责它们的统一停止。

use anyhow::{Context as _, Result};
use apihub_controller::{
    Coordinator, DistributedLock, GatewayOperator, InFlight, LeaderElector, PeriodicSynchronizer,
    Stores, Telemetry,
};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::OperatorConfig;
use crate::event_handler::EventHandler;
use crate::metrics::OperatorMetrics;
use crate::reconcile::{
    ApiHandler, ApplicationHandler, ApplyHandler, Context, DatasourceHandler, Handler, Reconciler,
    ServiceUnitHandler, TrafficcontrolHandler,
};

/// 控制器依赖的外部组件
pub struct Components {
    /// 资源存储
    pub stores: Stores,
    /// 网关编排
    pub gateway: Arc<dyn GatewayOperator>,
    /// 协调服务
    pub coordinator: Arc<dyn Coordinator>,
    /// 调用量来源
    pub telemetry: Arc<dyn Telemetry>,
    /// 本进程标识
    pub identity: String,
}

/// 资源类型到事件处理器的注册表
///
/// 在 [`Controller::new`] 中一次构建，停止后重新启动时复用同一组处理器。
pub struct HandlerTable {
    pub apis: Arc<EventHandler<ApiHandler>>,
    pub service_units: Arc<EventHandler<ServiceUnitHandler>>,
    pub trafficcontrols: Arc<EventHandler<TrafficcontrolHandler>>,
    pub applications: Arc<EventHandler<ApplicationHandler>>,
    pub applies: Arc<EventHandler<ApplyHandler>>,
    pub datasources: Arc<EventHandler<DatasourceHandler>>,
}

impl HandlerTable {
    /// 为每类资源构建协调器与事件处理器
    pub fn new(ctx: &Arc<Context>, concurrency: usize) -> Self {
        Self {
            apis: worker(ApiHandler::new(), ctx, concurrency),
            service_units: worker(ServiceUnitHandler::new(), ctx, concurrency),
            trafficcontrols: worker(TrafficcontrolHandler::new(), ctx, concurrency),
            applications: worker(ApplicationHandler::new(), ctx, concurrency),
            applies: worker(ApplyHandler::new(), ctx, concurrency),
            datasources: worker(DatasourceHandler::new(), ctx, concurrency),
        }
    }

    /// 已注册的资源类型
    pub fn kinds(&self) -> [&'static str; 6] {
        [
            self.apis.kind(),
            self.service_units.kind(),
            self.trafficcontrols.kind(),
            self.applications.kind(),
            self.applies.kind(),
            self.datasources.kind(),
        ]
    }

    fn spawn(&self, shutdown: &watch::Sender<bool>) -> Vec<JoinHandle<()>> {
        vec![
            self.apis.clone().spawn(shutdown.subscribe()),
            self.service_units.clone().spawn(shutdown.subscribe()),
            self.trafficcontrols.clone().spawn(shutdown.subscribe()),
            self.applications.clone().spawn(shutdown.subscribe()),
            self.applies.clone().spawn(shutdown.subscribe()),
            self.datasources.clone().spawn(shutdown.subscribe()),
        ]
    }
}

fn worker<H: Handler>(handler: H, ctx: &Arc<Context>, concurrency: usize) -> Arc<EventHandler<H>> {
    let reconciler = Arc::new(Reconciler::new(handler, ctx.clone()));
    Arc::new(EventHandler::new(reconciler, concurrency))
}

/// 控制器结构体
pub struct Controller {
    /// 协调上下文
    ctx: Arc<Context>,
    /// 事件处理器注册表
    handlers: Arc<HandlerTable>,
    /// 分布式写锁
    lock: Arc<DistributedLock>,
    /// 周期同步的领导者选举
    elector: Arc<LeaderElector>,
    /// 周期同步器
    synchronizer: Arc<PeriodicSynchronizer>,
    /// Operator 配置
    config: OperatorConfig,
    /// 关闭信号
    shutdown: watch::Sender<bool>,
    /// 后台任务
    handles: Vec<JoinHandle<()>>,
}

impl Controller {
    /// 创建新的控制器
    pub fn new(config: &OperatorConfig, components: Components) -> Result<Self> {
        let Components {
            stores,
            gateway,
            coordinator,
            telemetry,
            identity,
        } = components;

        let metrics = Arc::new(OperatorMetrics::new().context("创建指标失败")?);
        let lock = Arc::new(DistributedLock::new(
            coordinator.clone(),
            identity.clone(),
            config.lock.lock_config(),
        ));
        let elector = Arc::new(LeaderElector::new(coordinator, identity, config.sync.leader_config()));
        let in_flight = Arc::new(InFlight::new());
        let synchronizer = Arc::new(
            PeriodicSynchronizer::new(stores.clone(), telemetry, elector.clone(), config.sync.sync_config())
                .with_in_flight(in_flight.clone()),
        );
        let ctx = Arc::new(Context {
            stores,
            gateway,
            metrics,
            in_flight,
        });
        let handlers = Arc::new(HandlerTable::new(&ctx, config.worker.concurrency));
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            ctx,
            handlers,
            lock,
            elector,
            synchronizer,
            config: config.clone(),
            shutdown,
            handles: Vec::new(),
        })
    }

    /// 启动控制器
    pub async fn start(&mut self) -> Result<()> {
        if !self.handles.is_empty() {
            warn!("控制器已在运行");
            return Ok(());
        }
        self.shutdown.send_replace(false);

        let handles = self.handlers.spawn(&self.shutdown);
        self.handles.extend(handles);

        let elector = self.elector.clone();
        let shutdown = self.shutdown.subscribe();
        self.handles.push(tokio::spawn(async move { elector.run(shutdown).await }));

        let synchronizer = self.synchronizer.clone();
        self.handles.extend(synchronizer.spawn(self.shutdown.subscribe()));

        if self.config.metrics.enabled {
            let addr = self.config.metrics.socket_addr()?;
            let handle = self.ctx.metrics.clone().serve(addr, self.shutdown.subscribe())?;
            self.handles.push(handle);
        }

        info!(identity = %self.elector.identity(), "ApiHub Operator 控制器已启动");
        Ok(())
    }

    /// 停止控制器，等待全部后台任务与进行中的协调任务退出
    pub async fn stop(&mut self) -> Result<()> {
        // 没有接收者时发送失败，说明任务均已退出
        let _ = self.shutdown.send(true);

        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                warn!("后台任务异常退出: {}", e);
            }
        }

        info!("ApiHub Operator 控制器已停止");
        Ok(())
    }

    /// 获取事件处理器注册表
    pub fn handlers(&self) -> Arc<HandlerTable> {
        self.handlers.clone()
    }

    /// 获取协调上下文
    pub fn context(&self) -> Arc<Context> {
        self.ctx.clone()
    }

    /// 获取资源存储
    pub fn stores(&self) -> &Stores {
        &self.ctx.stores
    }

    /// 获取分布式写锁
    pub fn lock(&self) -> Arc<DistributedLock> {
        self.lock.clone()
    }

    /// 获取领导者选举
    pub fn elector(&self) -> Arc<LeaderElector> {
        self.elector.clone()
    }

    /// 获取指标
    pub fn metrics(&self) -> Arc<OperatorMetrics> {
        self.ctx.metrics.clone()
    }

    /// 是否正在运行
    pub fn is_running(&self) -> bool {
        !self.handles.is_empty()
    }
}
