use clap::Parser as _;
use image_transmit::archive::{
    ArchiveWriter, CompressedTarWriter, Compressor, DockerTarWriter, LoadTarget, SingleTarWriter,
};
use image_transmit::cli::{Args, Mode};
use image_transmit::config::{Repo, TransmitConfig, HOME};
use image_transmit::error::{Result, TransmitError};
use image_transmit::metadata::CompressionMetadata;
use image_transmit::reference::{gen_repo_url, insecure_target, RepoUrl};
use image_transmit::registry::manifest::Manifest;
use image_transmit::registry::{ImageDestination, ImageSource};
use image_transmit::squashfs::{
    CommandTooling, LayerFs, SquashCatFs, SquashTooling, SquashfsTar,
};
use image_transmit::task::{LogNotifier, OnlineTask, TaskContext, TaskEngine};
use image_transmit::util::{compare_versions, has_invalid_char};
use image_transmit::{History, LocalCache, LocalTemp};
use log::{error, info};
use std::cmp::Ordering;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(e) = run() {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let mode = args.mode()?;
    let mut conf = TransmitConfig::load()?;

    if conf.compressor.is_empty() {
        conf.compressor = if CommandTooling::available() {
            "squashfs".to_string()
        } else {
            "tar".to_string()
        };
    }
    let compressor: Compressor = conf.compressor.parse()?;
    if compressor == Compressor::Squashfs && !CommandTooling::available() {
        return Err(TransmitError::Config(
            "squashfs condition check failed, squashfs-tools must be installed".to_string(),
        ));
    }

    // pseudo destinations backed by a local runtime instead of a registry
    conf.dst_repos.push(Repo {
        name: "docker".to_string(),
        ..Default::default()
    });
    conf.dst_repos.push(Repo {
        name: "ctr".to_string(),
        ..Default::default()
    });

    if let Some(out) = &args.out {
        conf.outprefix = out.clone();
    }

    let src_repo = match &args.src {
        Some(name) => Some(
            conf.find_src_repo(name)
                .cloned()
                .ok_or_else(|| TransmitError::Config(format!("could not find repo: {}", name)))?,
        ),
        None => None,
    };
    let dst_repo = match &args.dst {
        Some(name) => Some(
            conf.find_dst_repo(name)
                .cloned()
                .ok_or_else(|| TransmitError::Config(format!("could not find repo: {}", name)))?,
        ),
        None => None,
    };

    let cache = if conf.cache.pathname.is_empty() {
        None
    } else {
        let keep_days = if conf.cache.keepdays > 0 { conf.cache.keepdays } else { 7 };
        let keep_size = if conf.cache.keepsize > 0 { conf.cache.keepsize } else { 10 };
        let cache = LocalCache::new(
            Path::new(HOME).join(&conf.cache.pathname),
            keep_days,
            keep_size,
        )?;
        // eviction runs once per program start
        cache.clean();
        Some(cache)
    };

    let temp = LocalTemp::new(Path::new(HOME).join("temp"))?;
    let mut ctx = TaskContext::new(cache, temp);
    if !conf.dingtalk.is_empty() {
        ctx.notify = Some(Box::new(LogNotifier));
    }

    match mode {
        Mode::Transmit | Mode::Watch => {
            let (Some(src), Some(dst)) = (&src_repo, &dst_repo) else {
                return Err(TransmitError::Config(
                    "source and destination repos are required".to_string(),
                ));
            };
            let lines = read_image_list(&args)?;
            if mode == Mode::Watch {
                watch(&conf, ctx, src, dst, &lines)
            } else {
                transmit(&conf, ctx, src, dst, &lines)
            }
        }
        Mode::Save => {
            let Some(src) = &src_repo else {
                return Err(TransmitError::Config("source repo is required".to_string()));
            };
            save(&conf, ctx, src, &read_image_list(&args)?, &args)
        }
        Mode::Upload => {
            let Some(dst) = &dst_repo else {
                return Err(TransmitError::Config("destination repo is required".to_string()));
            };
            upload(&conf, ctx, dst, &args)
        }
    }
}

/// One reference per line, from the list file or stdin.
fn read_image_list(args: &Args) -> Result<Vec<String>> {
    let text = match &args.lst {
        Some(file) => std::fs::read_to_string(file)
            .map_err(|e| TransmitError::Config(format!("read image list from file failed: {}", e)))?,
        None => {
            let mut text = String::new();
            std::io::stdin().read_to_string(&mut text)?;
            text
        }
    };

    let mut lines = Vec::new();
    for line in text.lines() {
        let line = line.replace('\t', "");
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if has_invalid_char(line) {
            return Err(TransmitError::Config(format!(
                "invalid chars in image list line: {}",
                line
            )));
        }
        lines.push(line.to_string());
    }
    if lines.is_empty() {
        return Err(TransmitError::Config("empty image list".to_string()));
    }
    info!("Get {} images", lines.len());
    Ok(lines)
}

fn begin_action(ctx: &TaskContext, conf: &TransmitConfig) {
    info!("==============BEGIN==============");
    info!(
        "Transmit params: max threads: {}, max retries: {}",
        conf.maxconn, conf.retries
    );
    ctx.update_sec_start(chrono::Local::now().timestamp());
}

fn end_action(ctx: &TaskContext, conf: &TransmitConfig) {
    if !conf.keeptemp {
        ctx.temp.clean();
    }
    ctx.update_sec_end(chrono::Local::now().timestamp());
    ctx.notify(&format!("Transmit task end, stat: {}", ctx.status_line()));
    info!("===============END===============");
}

/// Print the aggregate status line once a second until stopped.
fn start_reporter(ctx: Arc<TaskContext>) -> (Arc<AtomicBool>, std::thread::JoinHandle<()>) {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);
    let handle = std::thread::spawn(move || {
        while !stop_flag.load(AtomicOrdering::SeqCst) {
            info!("{}", ctx.status_line());
            std::thread::sleep(Duration::from_secs(1));
        }
    });
    (stop, handle)
}

fn stop_reporter(reporter: (Arc<AtomicBool>, std::thread::JoinHandle<()>)) {
    reporter.0.store(true, AtomicOrdering::SeqCst);
    let _ = reporter.1.join();
}

fn transmit(
    conf: &TransmitConfig,
    ctx: TaskContext,
    src_repo: &Repo,
    dst_repo: &Repo,
    lines: &[String],
) -> Result<()> {
    let ctx = Arc::new(ctx);
    begin_action(&ctx, conf);
    let engine = TaskEngine::new(conf.maxconn, conf.retries, Arc::clone(&ctx));

    for line in lines {
        let (src, dst) = gen_repo_url(&src_repo.registry, &dst_repo.registry, &dst_repo.repository, line);
        let _ = engine.generate_online_task(
            &src,
            &src_repo.user,
            &src_repo.password,
            &dst,
            &dst_repo.user,
            &dst_repo.password,
            conf.skiptlsverify,
        );
    }

    ctx.update_total_task(engine.task_len());
    let reporter = start_reporter(Arc::clone(&ctx));
    engine.run();
    stop_reporter(reporter);
    let failed = engine.failed_len();
    end_action(&ctx, conf);
    if failed > 0 || ctx.cancelled() {
        return Err(TransmitError::Registry(format!("{} tasks failed", failed)));
    }
    Ok(())
}

fn watch(
    conf: &TransmitConfig,
    mut ctx: TaskContext,
    src_repo: &Repo,
    dst_repo: &Repo,
    lines: &[String],
) -> Result<()> {
    ctx.history = Some(History::new(Path::new(HOME).join("history.yaml"))?);
    let ctx = Arc::new(ctx);
    begin_action(&ctx, conf);

    loop {
        let engine = TaskEngine::new(conf.maxconn, conf.retries, Arc::clone(&ctx));
        for line in lines {
            if ctx.cancelled() {
                break;
            }
            let (src_url, dst_url) =
                gen_repo_url(&src_repo.registry, &dst_repo.registry, &dst_repo.repository, line);
            let src_parsed = match RepoUrl::parse(&src_url) {
                Ok(u) => u,
                Err(e) => {
                    engine.put_invalid_task(&src_url);
                    error!("Url {} format error: {}, skipped", src_url, e);
                    continue;
                }
            };
            let dst_parsed = match RepoUrl::parse(&dst_url) {
                Ok(u) => u,
                Err(e) => {
                    engine.put_invalid_task(&dst_url);
                    error!("Url {} format error: {}, skipped", dst_url, e);
                    continue;
                }
            };

            let probe = match ImageSource::new(
                src_parsed.registry(),
                src_parsed.repository(),
                "",
                &src_repo.user,
                &src_repo.password,
                insecure_target(&src_url, conf.skiptlsverify),
            ) {
                Ok(probe) => probe,
                Err(e) => {
                    engine.put_invalid_task(&src_url);
                    error!("Url {} format error: {}, skipped", src_url, e);
                    continue;
                }
            };
            let tags = match probe.get_source_repo_tags() {
                Ok(tags) => tags,
                Err(e) => {
                    engine.put_invalid_task(&src_url);
                    error!("Fetch tag list failed for {} with error: {}", src_url, e);
                    continue;
                }
            };

            for tag in tags {
                let new_src = format!("{}/{}:{}", src_parsed.registry(), src_parsed.repository(), tag);
                let new_dst = format!("{}/{}:{}", dst_parsed.registry(), dst_parsed.repository(), tag);
                // tags below the listed floor are not transmitted
                if src_parsed.tag() != "latest"
                    && compare_versions(&tag, src_parsed.tag()) == Ordering::Less
                {
                    continue;
                }
                if ctx
                    .history
                    .as_ref()
                    .is_some_and(|history| history.skip(&new_src))
                {
                    continue;
                }

                let source = ImageSource::new(
                    src_parsed.registry(),
                    src_parsed.repository(),
                    &tag,
                    &src_repo.user,
                    &src_repo.password,
                    insecure_target(&src_url, conf.skiptlsverify),
                );
                let source = match source {
                    Ok(s) => s,
                    Err(e) => {
                        engine.put_invalid_task(&new_src);
                        error!("Url {} format error: {}, skipped", new_src, e);
                        continue;
                    }
                };
                let destination = ImageDestination::new(
                    dst_parsed.registry(),
                    dst_parsed.repository(),
                    &tag,
                    &dst_repo.user,
                    &dst_repo.password,
                    insecure_target(&dst_url, conf.skiptlsverify),
                );
                let destination = match destination {
                    Ok(d) => d,
                    Err(e) => {
                        engine.put_invalid_task(&new_dst);
                        error!("Url {} format error: {}, skipped", new_dst, e);
                        continue;
                    }
                };

                let notify_ctx = Arc::clone(&ctx);
                let notify_dst = new_dst.clone();
                let task = OnlineTask::with_callback(
                    source,
                    destination,
                    Arc::clone(&ctx),
                    Box::new(move |success, content| {
                        if success {
                            notify_ctx.notify(&format!(
                                "Transmit success, image: {}, stat: {}",
                                notify_dst, content
                            ));
                        } else {
                            notify_ctx.notify(&format!(
                                "Transmit failed, image: {}, error: {}",
                                notify_dst, content
                            ));
                        }
                    }),
                );
                engine.put_task(Box::new(task));
                info!("Generated a task for {} to {}", new_src, new_dst);
            }
        }

        ctx.update_total_task(ctx.total_task() + engine.task_len());
        engine.run();
        info!("{}", ctx.status_line());

        // inter-iteration sleep, interruptible by cancellation
        for _ in 0..conf.interval {
            if ctx.cancelled() {
                end_action(&ctx, conf);
                return Ok(());
            }
            std::thread::sleep(Duration::from_secs(1));
        }
        if ctx.cancelled() {
            break;
        }
    }
    end_action(&ctx, conf);
    Ok(())
}

fn save(
    conf: &TransmitConfig,
    mut ctx: TaskContext,
    src_repo: &Repo,
    lines: &[String],
    args: &Args,
) -> Result<()> {
    let worker_count = conf.maxconn.min(lines.len()).max(1);
    let compressor: Compressor = conf.compressor.parse()?;

    let pathname = Path::new(HOME).join(chrono::Local::now().format("%Y%m%d").to_string());
    std::fs::create_dir_all(&pathname)?;

    let incremental = args.inc.as_deref().is_some_and(|s| !s.is_empty());
    let mut work_name = chrono::Local::now()
        .format(if incremental { "img_incr_%Y%m%d%H%M" } else { "img_full_%Y%m%d%H%M" })
        .to_string();
    if !conf.outprefix.is_empty() {
        work_name = format!("{}_{}", conf.outprefix, work_name);
    }

    let meta = CompressionMetadata::new(&conf.compressor);
    if let Some(inc) = &args.inc {
        let reference = CompressionMetadata::load(Path::new(inc))?;
        let basename = Path::new(inc)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| inc.clone());
        meta.seed_from(&reference, &basename);
    }

    let mut dockerfile_save = false;
    if compressor == Compressor::Squashfs {
        ctx.temp.save_path(&work_name)?;
        ctx.squashfs_tar = Some(SquashfsTar::new(ctx.temp.pathname(), &work_name, None)?);
    } else if conf.singlefile {
        let (tar_name, writer): (String, Box<dyn ArchiveWriter>) = if conf.dockerfile {
            dockerfile_save = true;
            let tar_name = format!("{}.tar", work_name);
            let writer = DockerTarWriter::new(&LoadTarget::File(pathname.join(&tar_name)))?;
            (tar_name, Box::new(writer))
        } else {
            let tar_name = format!("{}.{}", work_name, compressor.extension());
            let writer = CompressedTarWriter::new(pathname.join(&tar_name), compressor)?;
            (tar_name, Box::new(writer))
        };
        info!("Create data file: {}", tar_name);
        meta.add_datafile(&tar_name, 0);
        *ctx.single_writer.lock().unwrap() = Some(SingleTarWriter::new(writer));
    } else {
        for i in 0..worker_count {
            let tar_name = format!("{}_{}.{}", work_name, i, compressor.extension());
            info!("Create data file: {}", tar_name);
            meta.add_datafile(&tar_name, 0);
            let writer = CompressedTarWriter::new(pathname.join(&tar_name), compressor)?;
            ctx.tar_writers.push(std::sync::Mutex::new(writer));
        }
    }
    ctx.comp_meta = Some(meta);

    let ctx = Arc::new(ctx);
    begin_action(&ctx, conf);
    let engine = TaskEngine::new(worker_count, conf.retries, Arc::clone(&ctx));
    for line in lines {
        let (src, _) = gen_repo_url(&src_repo.registry, "", "", line);
        let _ = engine.generate_offline_down_task(
            &src,
            &src_repo.user,
            &src_repo.password,
            conf.skiptlsverify,
        );
    }
    ctx.update_total_task(engine.task_len());
    let reporter = start_reporter(Arc::clone(&ctx));
    engine.run();
    stop_reporter(reporter);

    // finalize writers and emit the meta file even for a cancelled,
    // partial run
    if ctx.has_single_writer() {
        if let Some(mut writer) = ctx.finish_single_writer()? {
            if dockerfile_save {
                if let Some(meta) = ctx.comp_meta.as_ref() {
                    let mut images = Vec::new();
                    for (url, manifest_text) in meta.manifests() {
                        images.push((url, Manifest::parse(manifest_text.as_bytes())?));
                    }
                    if let Some(docker) = writer.as_docker() {
                        docker.append_save_meta(&images)?;
                    }
                }
            }
            writer.close()?;
        }
    } else if ctx.squashfs_tar.is_none() {
        ctx.close_tar_writers()?;
    }

    if let Some(squashfs) = &ctx.squashfs_tar {
        info!("Mksquashfs compress start");
        let fs_file = pathname.join(format!("{}.squashfs", work_name));
        CommandTooling.pack(squashfs.work_dir(), &fs_file)?;
        info!("Mksquashfs compress end");
        if let Some(meta) = ctx.comp_meta.as_ref() {
            meta.add_datafile(&format!("{}.squashfs", work_name), 0);
        }
    }

    if let Some(meta) = ctx.comp_meta.as_ref() {
        let meta_file = meta.save(&pathname, &work_name)?;
        info!("Create meta file: {}", meta_file.display());
    }

    let failed = engine.failed_len();
    end_action(&ctx, conf);
    if failed > 0 || ctx.cancelled() {
        return Err(TransmitError::Registry(format!("{} tasks failed", failed)));
    }
    Ok(())
}

fn upload(conf: &TransmitConfig, mut ctx: TaskContext, dst_repo: &Repo, args: &Args) -> Result<()> {
    let img = args
        .img
        .clone()
        .ok_or_else(|| TransmitError::Config("upload mode requires --img".to_string()))?;
    let img = img.as_str();
    let meta = CompressionMetadata::load(Path::new(img))?;
    let pathname: PathBuf = Path::new(img)
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    meta.verify_datafiles(&pathname)?;

    let refs: Vec<String> = meta
        .manifests()
        .keys()
        .filter(|k| !k.contains("@sha256:"))
        .cloned()
        .collect();
    info!(
        "The img file contains {} images:\n{}",
        refs.len(),
        refs.join("\n")
    );

    if meta.compressor() == "squashfs" {
        let filename = meta
            .datafiles()
            .keys()
            .find(|k| k.ends_with(".squashfs"))
            .cloned()
            .ok_or_else(|| {
                TransmitError::Config("squashfs meta file without a squashfs datafile".to_string())
            })?;
        let work_name = filename.trim_end_matches(".squashfs").to_string();
        if !CommandTooling::unsquashfs_available() {
            return Err(TransmitError::Config(
                "squashfs archive but unsquashfs is not installed".to_string(),
            ));
        }
        if conf.squashfs_flag("stream") || conf.squashfs_flag("nocmd") {
            // read members straight out of the image, no unpack
            let layer_fs: Arc<dyn LayerFs> = Arc::new(SquashCatFs::new(pathname.join(&filename))?);
            ctx.squashfs_tar = Some(SquashfsTar::new(ctx.temp.pathname(), &work_name, Some(layer_fs))?);
        } else {
            info!("Unsquashfs uncompress start");
            let dest = ctx.temp.pathname().join(&work_name);
            if dest.exists() {
                std::fs::remove_dir_all(&dest)?;
            }
            CommandTooling.unpack(&pathname.join(&filename), &dest)?;
            ctx.temp.track(dest);
            info!("Unsquashfs uncompress end");
            ctx.squashfs_tar = Some(SquashfsTar::new(ctx.temp.pathname(), &work_name, None)?);
        }
    }
    ctx.comp_meta = Some(meta);

    let ctx = Arc::new(ctx);
    begin_action(&ctx, conf);
    let engine = TaskEngine::new(conf.maxconn, conf.retries, Arc::clone(&ctx));
    for reference in &refs {
        let load_target = match dst_repo.name.as_str() {
            "docker" => Some(LoadTarget::Docker),
            "ctr" => Some(LoadTarget::Ctr),
            _ => None,
        };
        if load_target.is_some() {
            let _ = engine.generate_offline_upload_task(
                reference,
                "",
                &pathname,
                &dst_repo.user,
                &dst_repo.password,
                conf.skiptlsverify,
                load_target,
            );
        } else {
            let (_, dst) = gen_repo_url("", &dst_repo.registry, &dst_repo.repository, reference);
            let _ = engine.generate_offline_upload_task(
                reference,
                &dst,
                &pathname,
                &dst_repo.user,
                &dst_repo.password,
                conf.skiptlsverify,
                None,
            );
        }
    }
    ctx.update_total_task(engine.task_len());
    let reporter = start_reporter(Arc::clone(&ctx));
    engine.run();
    stop_reporter(reporter);
    let failed = engine.failed_len();
    end_action(&ctx, conf);
    if failed > 0 || ctx.cancelled() {
        return Err(TransmitError::Registry(format!("{} tasks failed", failed)));
    }
    Ok(())
}
