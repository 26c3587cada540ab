use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing::*;

use bucketfs_async::bucket::{Bucket, CachingBucket, MemBucket, PrefixBucket};
use bucketfs_async::clock::SystemClock;
use bucketfs_async::write::NullWriteBuffer;
use bucketfs_async::{BucketFs, BucketFuse, Options};

#[derive(Parser)]
#[clap(name = "bucketfuse-rs")]
struct Flags {
    /// Volume name of the in-memory demo bucket
    bucket: String,
    /// Mountpoint
    mountpoint: PathBuf,
    #[clap(flatten)]
    options: Options,
    /// Mount only the subtree under this prefix
    #[clap(long)]
    only_dir: Option<String>,
    /// TTL (s) for the stat-caching bucket decorator; 0 disables it
    #[clap(long, default_value_t = 60)]
    stat_cache_ttl_secs: u64,
    #[clap(long, short)]
    debug: bool,
}

async fn mount(fs: Arc<BucketFs>, mountpoint: &std::path::Path) -> anyhow::Result<()> {
    let fuse = BucketFuse::new(fs.clone());

    let _mount = fuser::spawn_mount2(
        fuse,
        mountpoint,
        &[
            fuser::MountOption::FSName("bucketfs".into()),
            fuser::MountOption::DefaultPermissions,
        ],
    )?;
    tokio::signal::ctrl_c().await?;
    fs.stop().await;
    Ok(())
}

async fn main_impl(args: Flags) -> anyhow::Result<()> {
    bucketfs_async::utils::setup_logger(args.debug)?;
    info!("Mounting bucket {:?} at {:?}", args.bucket, args.mountpoint);

    let clock = Arc::new(SystemClock);
    let mut bucket: Arc<dyn Bucket> = MemBucket::new(&args.bucket);
    if let Some(prefix) = &args.only_dir {
        bucket = PrefixBucket::new(bucket, prefix);
    }
    if args.stat_cache_ttl_secs > 0 {
        bucket = CachingBucket::new(
            bucket,
            clock.clone(),
            std::time::Duration::from_secs(args.stat_cache_ttl_secs),
            args.options.enable_nonexistent_type_cache,
            4096,
        );
    }

    let fs = BucketFs::new(bucket, &args.options, clock, Arc::new(NullWriteBuffer))?;
    mount(fs, &args.mountpoint).await?;

    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Flags::parse();
    if let Err(e) = main_impl(args).await {
        error!("{:?}", e);
        process::exit(1)
    }
}
